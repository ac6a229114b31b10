use mongodb::error::Error as MongoError;
use thiserror::Error;

/// Result alias for MongoDB store operations.
pub type MongoResult<T> = std::result::Result<T, MongoDaoError>;

/// Failures of the MongoDB snapshot store.
#[derive(Debug, Error)]
pub enum MongoDaoError {
    /// Required environment variable is missing.
    #[error("missing MongoDB environment variable `{var}`")]
    MissingEnvVar { var: &'static str },
    /// The connection string could not be parsed.
    #[error("failed to parse MongoDB connection URI `{uri}`")]
    InvalidUri {
        uri: String,
        #[source]
        source: MongoError,
    },
    /// Driver client construction failed.
    #[error("failed to build MongoDB client from options")]
    ClientConstruction {
        #[source]
        source: MongoError,
    },
    /// The server never answered during startup.
    #[error("MongoDB ping failed during initial connection after {attempts} attempt(s)")]
    InitialPing {
        attempts: u32,
        #[source]
        source: MongoError,
    },
    /// A later health check ping failed.
    #[error("MongoDB ping health check failed")]
    HealthPing {
        #[source]
        source: MongoError,
    },
    /// Index creation was rejected.
    #[error("failed to ensure index `{index}` on collection `{collection}`")]
    EnsureIndex {
        collection: &'static str,
        index: &'static str,
        #[source]
        source: MongoError,
    },
    /// Upserting a snapshot failed.
    #[error("failed to save snapshot for guild {guild_id}")]
    SaveSnapshot {
        guild_id: u64,
        #[source]
        source: MongoError,
    },
    /// Reading a snapshot failed.
    #[error("failed to load snapshot for guild {guild_id}")]
    LoadSnapshot {
        guild_id: u64,
        #[source]
        source: MongoError,
    },
    /// Deleting a snapshot failed.
    #[error("failed to delete snapshot for guild {guild_id}")]
    DeleteSnapshot {
        guild_id: u64,
        #[source]
        source: MongoError,
    },
    /// Listing the collection failed.
    #[error("failed to list snapshots")]
    ListSnapshots {
        #[source]
        source: MongoError,
    },
    /// A stored document did not match the snapshot model.
    #[error("stored snapshot `{id}` is malformed: {reason}")]
    MalformedDocument { id: String, reason: &'static str },
}
