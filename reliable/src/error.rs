use no_std_io2::io;

pub type Result<T> = core::result::Result<T, Error>;

/// An error that can occur in the `reliable` crate.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("packet header was malformed")]
    InvalidHeader,
    #[error("fragment index {0} is out of range for a count of {1}")]
    FragmentIndexOutOfRange(u8, u8),
    #[error("fragment reassembly buffer is full, dropped oldest partial message")]
    ReassemblyBufferFull,
    #[error("packet of {0} bytes exceeds the {1}-byte limit")]
    PacketTooLarge(usize, usize),
    #[error(transparent)]
    Io(#[from] io::Error),
}
