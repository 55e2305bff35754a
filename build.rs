//! Generates the capture protocol service glue.
//!
//! Message types are hand-written prost structs in `src/discovery/proto.rs`, so the
//! services are described with the manual builder and no `protoc` is required.

use tonic_build::manual::{Builder, Method, Service};

const CODEC: &str = "tonic::codec::ProstCodec";
const PROTO: &str = "crate::discovery::proto";

fn main() {
    let faas = Service::builder()
        .name("FaasService")
        .package("nimbus.faas.v1")
        .method(
            Method::builder()
                .name("trigger_stream")
                .route_name("TriggerStream")
                .input_type(format!("{PROTO}::ClientMessage"))
                .output_type(format!("{PROTO}::ServerMessage"))
                .codec_path(CODEC)
                .client_streaming()
                .server_streaming()
                .build(),
        )
        .build();

    let resources = Service::builder()
        .name("ResourceService")
        .package("nimbus.resource.v1")
        .method(
            Method::builder()
                .name("declare")
                .route_name("Declare")
                .input_type(format!("{PROTO}::ResourceDeclareRequest"))
                .output_type(format!("{PROTO}::ResourceDeclareResponse"))
                .codec_path(CODEC)
                .build(),
        )
        .method(
            Method::builder()
                .name("details")
                .route_name("Details")
                .input_type(format!("{PROTO}::ResourceDetailsRequest"))
                .output_type(format!("{PROTO}::ResourceDetailsResponse"))
                .codec_path(CODEC)
                .build(),
        )
        .build();

    Builder::new().compile(&[faas, resources]);

    println!("cargo:rerun-if-changed=build.rs");
}
