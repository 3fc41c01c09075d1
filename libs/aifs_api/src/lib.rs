//! Generated gRPC bindings for the AIFS asset store.
//!
//! The wire contract lives in `proto/aifs.proto`; this crate only re-exports
//! what `tonic-build` generates, so that the storage backend does not need a
//! protoc toolchain in its own build.

pub mod proto {
    tonic::include_proto!("aifs.v1");
}

pub use proto::aifs_client::AifsClient;
pub use proto::{
    AssetChunk, AssetDescriptor, Branch, DeleteAssetRequest, DeleteAssetResponse, GetAssetRequest,
    ListAssetsRequest, ListAssetsResponse, ListBranchesRequest, ListBranchesResponse,
    PutAssetHeader, PutAssetRequest, StatAssetRequest, put_asset_request,
};

pub const DEFAULT_AIFS_PORT: u16 = 50052;
