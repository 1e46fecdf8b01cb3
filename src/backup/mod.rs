pub mod archive;
pub mod artifact;
pub mod cleanup;
pub mod db_dump;
pub mod logic;
pub mod s3_upload;
pub mod scheduler;

pub use artifact::BackupArtifact;
pub use db_dump::MongoDumper;
pub use logic::BackupPipeline;
pub use s3_upload::S3Storage;
pub use scheduler::run_scheduler;
