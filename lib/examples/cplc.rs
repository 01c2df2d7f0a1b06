use offline_signer::apdu::DEFAULT_APPLET_AID;
use offline_signer::error::SeError;
use offline_signer::pcsc::{list_readers, PcscConnector};
use offline_signer::record::get_cplc;
use offline_signer::transport::{SeConnector, SeSession};

// Example reading the CPLC block of the card in the first reader
#[tokio::main]
async fn main() -> Result<(), SeError> {
    dbg!(list_readers()?);

    let connector = PcscConnector::new("", DEFAULT_APPLET_AID.to_vec());
    let session = connector.open_card().await?;
    let cplc = get_cplc(&session).await?;
    println!("CPLC: {}", hex::encode_upper(&cplc));
    session.close()?;

    // selecting the applet confirms it is installed
    let session = connector.open().await?;
    println!("Applet {} selected", hex::encode_upper(DEFAULT_APPLET_AID));
    session.close()
}
