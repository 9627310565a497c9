/// What a bind request establishes on the connection once it succeeds.
///
/// Bind requests carry this so the connection can track who it is bound
/// as. Credentials are never stored here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMetadata {
    pub protocol_version: u8,
    pub dn: String,
    pub anonymous: bool,
}

impl BindMetadata {
    /// Simple bind as `dn`; an empty DN is anonymous.
    pub fn simple(protocol_version: u8, dn: impl Into<String>) -> Self {
        let dn = dn.into();
        Self {
            protocol_version,
            anonymous: dn.is_empty(),
            dn,
        }
    }

    pub fn anonymous(protocol_version: u8) -> Self {
        Self::simple(protocol_version, "")
    }
}
