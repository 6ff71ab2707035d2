// Include generated prost/tonic code. build.rs emits one file per proto package into OUT_DIR
pub mod lnrpc {
    #![allow(clippy::all, clippy::pedantic)]
    include!(concat!(env!("OUT_DIR"), "/lnrpc.rs"));
}

pub mod routerrpc {
    #![allow(clippy::all, clippy::pedantic)]
    include!(concat!(env!("OUT_DIR"), "/routerrpc.rs"));
}

pub mod invoicesrpc {
    #![allow(clippy::all, clippy::pedantic)]
    include!(concat!(env!("OUT_DIR"), "/invoicesrpc.rs"));
}
