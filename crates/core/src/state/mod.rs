pub mod checkpoints;
pub mod db;
pub mod io;

pub use checkpoints::{
    checkpoint_name, resume_point, Checkpoint, CheckpointStore, FileCheckpointStore,
    SqliteCheckpointStore,
};
pub use db::RelayDb;
