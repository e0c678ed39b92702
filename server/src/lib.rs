pub mod ai;
pub mod args;
pub mod audit;
pub mod chat;
pub mod confirm;
pub mod gateway;
pub mod http;
pub mod hub;
pub mod registry;
pub mod server;
pub mod store;
pub mod transport;
pub mod ws;

pub mod proto {
    pub mod tunnel {
        tonic::include_proto!("tunnel");
    }
}
