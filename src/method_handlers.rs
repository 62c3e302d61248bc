mod connect;
pub use connect::connect_denier::ConnectDenier;
pub use connect::tunnel_connect::TunnelConnect;
pub use connect::Connect;
