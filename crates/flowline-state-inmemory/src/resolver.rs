use std::collections::HashMap;

use flowline_core::{AddressResolver, CoreError, MemberIdentity, PhysicalAddress};

/// Fixed member to address table
#[derive(Debug, Clone, Default)]
pub struct StaticAddressResolver {
    addresses: HashMap<MemberIdentity, PhysicalAddress>,
}

impl StaticAddressResolver {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a member
    pub fn with_member(mut self, member: MemberIdentity, address: PhysicalAddress) -> Self {
        self.addresses.insert(member, address);
        self
    }

    /// Members in the table
    pub fn members(&self) -> impl Iterator<Item = &MemberIdentity> {
        self.addresses.keys()
    }
}

impl AddressResolver for StaticAddressResolver {
    fn resolve(&self, member: &MemberIdentity) -> Result<PhysicalAddress, CoreError> {
        self.addresses
            .get(member)
            .cloned()
            .ok_or_else(|| CoreError::AddressResolutionError(format!("No address known for {}", member)))
    }
}
