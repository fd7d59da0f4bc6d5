pub mod config;
pub mod logging;
pub mod metadata;
pub mod paths;
pub mod unique_id;
pub mod uri;

pub use config::{
    BackendCommand, BackendsConfig, Config, ConfigError, LogLevel, LoggingConfig, PlaybackConfig,
    ScanConfig, ValidationError,
};
pub use logging::{init_logging, LoggingError, LoggingGuard, ProcessRole};
pub use metadata::Metadata;
pub use paths::{AppDirs, DirsError};
pub use unique_id::{SharedIdAllocator, UniqueId, UniqueIdAllocator, UniqueIdError};
pub use uri::{Uri, UriError, ID_OPTION, SUB_RESOURCE_INDEX_OPTION};

pub const APP_NAME: &str = "tandem";
pub const APP_AUTHOR: &str = "Tandem";
pub const APP_QUALIFIER: &str = "io";
