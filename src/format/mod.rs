pub mod device_map;

pub use device_map::{CacheDeviceMap, DeviceId};
