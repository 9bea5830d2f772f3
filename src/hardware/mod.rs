pub mod factory;

pub use factory::DeviceFactory;
