/// Associates a multiplexer registration with the record that owns it.
///
/// The token is the `u64` payload stored in the kernel event; dispatch
/// looks it up in the proactor's registry. A token that misses the
/// registry belongs to a descriptor that was deregistered while the event
/// was in flight, and the event is dropped.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct Token(pub(crate) usize);

impl From<Token> for usize {
    fn from(val: Token) -> usize {
        val.0
    }
}
