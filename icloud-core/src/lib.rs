mod auth;
mod client;

pub use auth::{authenticate, resolve_password, AuthConfig};
pub use client::{
    ApiErrorClass, DriveApi, DriveChild, DriveError, DriveHandle, DriveKind, HttpDriveClient,
    RootSummary,
};
