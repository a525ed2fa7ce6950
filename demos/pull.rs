use blip_sync::headers::Authenticator;
use blip_sync::output::ScreenOutput;
use blip_sync::replicator::{Replicator, ReplicatorConfiguration, ReplicatorType};

// Pulls a database from a local Sync Gateway and prints every document to
// the console. Point SGW_SESSION at a session id minted through the admin
// port, e.g. `sgwcli auth session -n insurance -U region@central`.

#[tokio::main]
async fn main() {
    env_logger::init();

    let session = std::env::var("SGW_SESSION").unwrap_or_default();
    let config = ReplicatorConfiguration::new(
        "insurance",
        "127.0.0.1",
        ReplicatorType::Pull,
        Authenticator::session(session),
        Box::new(ScreenOutput::new()),
    );

    let mut replicator = match Replicator::new(config) {
        Ok(replicator) => replicator,
        Err(err) => {
            eprintln!("Error: {}", err);
            return;
        }
    };

    if let Err(err) = replicator.start().await {
        eprintln!("Error: {}", err);
        return;
    }
    if let Err(err) = replicator.replicate().await {
        eprintln!("Error: {}", err);
    }
    replicator.stop().await;
}
