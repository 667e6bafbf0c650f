//! Generated tonic/prost bindings for the `goconnectd` local IPC surface
//! (spec §4.10). All seven `.proto` files share the `goconnect` package, so
//! `tonic_build` emits one module here with every message and service trait.

pub mod goconnect {
    tonic::include_proto!("goconnect");
}
