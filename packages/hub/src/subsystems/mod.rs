pub mod ingress;
pub mod lifecycle;
pub mod monitor;
pub mod network;
pub mod pool;
pub mod router;
pub mod scaler;
pub mod upstream;
