mod device;
mod reading;

pub use device::DeviceRepository;
pub use reading::{Persistence, ReadingRepository};
