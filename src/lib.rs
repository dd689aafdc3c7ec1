#![doc = include_str!("../README.md")]

pub mod client;
pub mod config;
pub mod error;
pub mod http;
pub mod oidc;
pub mod pkce;
pub mod protocol;
#[cfg(feature = "reqwest")]
pub mod reqwest_client;
pub mod session;
pub mod token;
pub mod well_known;
pub mod worker;

#[cfg(test)]
mod test_support;

// Re-exports for convenient access
pub use client::{
    Location, MemoryLocation, MemoryStorage, SessionStorage, WorkerClient, WorkerClientBuilder,
};
pub use config::{Config, ResponseMode};
pub use error::Error;
pub use http::{HttpClient, HttpMethod, HttpRequest, HttpResponse, RequestBody};
pub use pkce::{generate_code_challenge, generate_code_verifier};
pub use protocol::{
    CustomGrantRequest, CustomGrantResponse, MessageType, Notification, SignInResponse, UserInfo,
};
#[cfg(feature = "reqwest")]
pub use reqwest_client::ReqwestClient;
pub use well_known::ServiceEndpoints;
pub use worker::{Worker, WorkerChannel};
