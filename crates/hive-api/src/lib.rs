//! Wire layer of the hive master.
//!
//! - `grpc`: the `hive.v1` protobuf contract, the slave-facing
//!   [`MasterGrpcService`] and [`GrpcSlaveConnector`], the master's
//!   outbound transport to slaves.
//! - `http`: the admin REST surface ([`HttpApi`]) over any [`ApiHandler`].

#[cfg(feature = "grpc")]
pub mod proto {
    tonic::include_proto!("hive.v1");
}

mod error;
pub use error::ApiError;

mod handler;
pub use handler::{ApiHandler, LiveStatsView, StatusView};

mod adapter;
pub use adapter::MasterApiAdapter;

#[cfg(feature = "grpc")]
mod convert;

#[cfg(feature = "grpc")]
mod grpc;

#[cfg(feature = "grpc")]
pub use grpc::MasterGrpcService;

#[cfg(feature = "grpc")]
mod connector;

#[cfg(feature = "grpc")]
pub use connector::GrpcSlaveConnector;

#[cfg(feature = "grpc")]
pub use proto::{
    master_service_client::MasterServiceClient, master_service_server::MasterServiceServer,
    slave_service_client::SlaveServiceClient, slave_service_server::SlaveServiceServer,
};

#[cfg(feature = "grpc")]
pub use tonic;

#[cfg(feature = "http")]
mod http;

#[cfg(feature = "http")]
pub use http::HttpApi;

#[cfg(feature = "http")]
pub use axum;
