//! JSON request and response types for the orchestrator, and a JSON-lines server that
//! answers one response line per request line.

use crate::error::{Error, ErrorKind};
use crate::orchestrator::{KeygenParams, Orchestrator, SignParams};
use crate::transport::SeConnector;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Byte fields travel as standard base64 strings.
pub(crate) mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.trim())
            .map_err(|e| de::Error::custom(format!("invalid base64: {e}")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DeleteParams {
    pub user_name: String,
    pub address: String,
    #[serde(with = "base64_bytes")]
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Keygen(KeygenParams),
    Sign(SignParams),
    Delete(DeleteParams),
    GetCplc,
}

impl Request {
    pub fn op(&self) -> &'static str {
        match self {
            Request::Keygen(_) => "keygen",
            Request::Sign(_) => "sign",
            Request::Delete(_) => "delete",
            Request::GetCplc => "get_cplc",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApiError {
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Response {
    Keygen {
        address: String,
        #[serde(with = "base64_bytes")]
        encrypted_key: Vec<u8>,
    },
    Sign {
        signature: String,
    },
    Delete {
        ok: bool,
        record_index: u8,
        record_count: u8,
    },
    Cplc {
        #[serde(with = "base64_bytes")]
        cplc_info: Vec<u8>,
        cplc_hex: String,
    },
    Error {
        error: ApiError,
    },
}

impl Response {
    pub fn is_error(&self) -> bool {
        matches!(self, Response::Error { .. })
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|e| {
            json!({"error": {"kind": ErrorKind::IoFailed, "message": e.to_string()}})
        })
    }
}

impl From<Error> for Response {
    fn from(e: Error) -> Self {
        Response::Error {
            error: ApiError {
                kind: e.kind(),
                message: e.to_string(),
            },
        }
    }
}

/// Parse one request line, splitting off the optional `id` echoed in the reply.
pub fn parse_request(line: &str) -> (Option<Value>, Result<Request, Error>) {
    let mut value: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(e) => return (None, Err(Error::InputInvalid(format!("invalid JSON: {e}")))),
    };
    let id = value.as_object_mut().and_then(|fields| fields.remove("id"));
    let request = serde_json::from_value(value)
        .map_err(|e| Error::InputInvalid(format!("invalid request: {e}")));
    (id, request)
}

/// Execute a request. Errors become [`Response::Error`].
pub async fn handle<C: SeConnector>(
    orchestrator: &Orchestrator<C>,
    request: Request,
    cancel: &CancellationToken,
) -> Response {
    let op = request.op();
    match execute(orchestrator, request, cancel).await {
        Ok(response) => response,
        Err(e) => {
            warn!("{op} failed: {e}");
            e.into()
        }
    }
}

async fn execute<C: SeConnector>(
    orchestrator: &Orchestrator<C>,
    request: Request,
    cancel: &CancellationToken,
) -> Result<Response, Error> {
    match request {
        Request::Keygen(params) => {
            let output = orchestrator.keygen(&params, cancel).await?;
            Ok(Response::Keygen {
                address: output.address,
                encrypted_key: output.envelope,
            })
        }
        Request::Sign(params) => {
            let signature = orchestrator.sign(&params, cancel).await?;
            Ok(Response::Sign { signature })
        }
        Request::Delete(params) => {
            let slot = orchestrator
                .delete(&params.user_name, &params.address, &params.signature, cancel)
                .await?;
            Ok(Response::Delete {
                ok: true,
                record_index: slot.index,
                record_count: slot.count,
            })
        }
        Request::GetCplc => {
            let cplc = orchestrator.get_cplc(cancel).await?;
            Ok(Response::Cplc {
                cplc_hex: hex::encode_upper(&cplc),
                cplc_info: cplc,
            })
        }
    }
}

/// Handle one request line and render the reply line.
pub async fn handle_line<C: SeConnector>(
    orchestrator: &Orchestrator<C>,
    line: &str,
    cancel: &CancellationToken,
) -> String {
    let (id, request) = parse_request(line);
    let response = match request {
        Ok(request) => handle(orchestrator, request, cancel).await,
        Err(e) => e.into(),
    };
    let mut reply = response.to_json();
    if let (Some(id), Some(fields)) = (id, reply.as_object_mut()) {
        fields.insert("id".to_string(), id);
    }
    reply.to_string()
}

/// Answer JSON-lines requests from `input` until it closes or `cancel` fires. Requests run
/// concurrently, so replies may arrive out of order and carry the request `id`.
pub async fn serve<C, R, W>(
    orchestrator: Arc<Orchestrator<C>>,
    input: R,
    mut output: W,
    cancel: CancellationToken,
) -> std::io::Result<()>
where
    C: SeConnector + 'static,
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let mut lines = input.lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => {
                    debug!("Received request of {} bytes", line.len());
                    let orchestrator = orchestrator.clone();
                    let tx = tx.clone();
                    let cancel = cancel.child_token();
                    tokio::spawn(async move {
                        let reply = handle_line(&orchestrator, &line, &cancel).await;
                        // the receiver only closes after every sender is gone
                        let _ = tx.send(reply);
                    });
                }
                None => break,
            },
            Some(reply) = rx.recv() => write_line(&mut output, &reply).await?,
            _ = cancel.cancelled() => break,
        }
    }
    drop(tx);
    while let Some(reply) = rx.recv().await {
        write_line(&mut output, &reply).await?;
    }
    Ok(())
}

async fn write_line<W: AsyncWrite + Unpin>(output: &mut W, line: &str) -> std::io::Result<()> {
    output.write_all(line.as_bytes()).await?;
    output.write_all(b"\n").await?;
    output.flush().await
}
