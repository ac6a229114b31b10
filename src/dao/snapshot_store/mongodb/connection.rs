use std::time::Duration;

use mongodb::{Client, Database, bson::doc};
use tokio::time::sleep;
use tracing::debug;

use super::{
    config::MongoConfig,
    error::{MongoDaoError, MongoResult},
};

/// Pings tried before a connection attempt fails. The storage supervisor retries on its
/// own, slower cadence after that.
const PING_ATTEMPTS: u32 = 3;
const PING_STEP: Duration = Duration::from_millis(200);

/// Open the configured database and check that the server answers.
pub async fn open_database(config: &MongoConfig) -> MongoResult<Database> {
    let client = Client::with_options(config.options.clone())
        .map_err(|source| MongoDaoError::ClientConstruction { source })?;
    let database = client.database(&config.database_name);

    let mut attempt = 1;
    loop {
        match database.run_command(doc! { "ping": 1 }).await {
            Ok(_) => return Ok(database),
            Err(source) if attempt >= PING_ATTEMPTS => {
                return Err(MongoDaoError::InitialPing {
                    attempts: attempt,
                    source,
                });
            }
            Err(err) => {
                debug!(attempt, database = %config.database_name, error = %err, "MongoDB ping failed");
                sleep(PING_STEP * attempt).await;
                attempt += 1;
            }
        }
    }
}
