//! Generated protobuf/gRPC types for the swarmcast CDN fabric.
//!
//! Everything here is produced by `tonic-prost-build` from
//! `proto/swarmcast.proto`; see `build.rs`.

pub mod proto {
    #![allow(clippy::all)]
    #![allow(warnings)]
    tonic::include_proto!("swarmcast");
}

pub use proto::{
    cdn_client, cdn_server, publish_response, signal::Payload as SignalPayload, subscribe_request,
    subscribe_response, PublishRequest, PublishResponse, ResolveResponse, Signal, Subscriber,
    Subscription, SubscribeRequest, SubscribeResponse, Track, TraverseRequest, TraverseResponse,
};
pub use proto::publish_response::Operation as PublishResponseOp;
pub use proto::subscribe_request::Operation as SubscribeRequestOp;
pub use proto::subscribe_response::Operation as SubscribeResponseOp;
