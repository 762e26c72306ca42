//! Device enumeration and selection

mod enumerator;

pub use enumerator::DeviceEnumerator;
