pub mod crypto;
pub mod checksum;
pub mod keys;
pub mod material;
pub mod machine;
pub mod cartridge;
pub mod codec;
pub mod manager;
pub mod formatter;

pub use cartridge::{CartridgeRecord, KeyFragment};
pub use codec::{get_codec, Codec, CodecError, FormatVersion, IntegrityError};
pub use machine::{DeviceUid, MachineIdentity, MachineType};
pub use manager::{Manager, ManagerOptions};
