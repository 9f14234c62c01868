pub mod db;
pub mod vectordb;

pub use db::{AlertRecord, Db, OutputRecord, PromptRecord};
pub use vectordb::{Embedder, HashEmbedder, PackageIndex, PackageMatch, PackageRecord, PackageStatus};
