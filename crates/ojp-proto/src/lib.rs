/// Generated gRPC protocol definitions for the OJP database proxy.
///
/// This crate provides the protocol buffer definitions and generated code
/// for communication between database clients and the proxy fleet.
pub mod ojp {
    pub mod v1 {
        tonic::include_proto!("ojp.v1");
    }
}

// Re-export commonly used types for convenience
pub use ojp::v1::*;
