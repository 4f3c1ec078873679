pub mod models {
    pub mod point;
    pub mod station;
    pub mod things;
}

pub mod cli;
pub mod client;
pub mod config;
pub mod db {
    pub mod models;
    pub mod store;
}
pub mod schema;
pub mod shutdown;
pub mod transport;
pub mod utils;
pub mod services {
    pub mod ingest;
    pub mod normalize;
    pub mod reconcile;
    pub mod station;
}
