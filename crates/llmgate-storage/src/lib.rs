pub mod entities;
pub mod repository;
pub mod seaorm;

pub use repository::{KeyRow, KeyStatus, Repository, RepositoryError, RepositoryResult};
pub use seaorm::{SeaOrmRepository, dsn_from_env};
