pub mod invoice;
pub mod ldk;

pub use ldk::LdkLightningClient;
