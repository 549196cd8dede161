use crate::network::packet::snac::FamilyVersion;

/// 服务器在 ServerReady 中声明的 family 集合，有序
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnacFamilySet(Vec<u16>);

impl SnacFamilySet {
    pub fn new(families: impl IntoIterator<Item = u16>) -> Self {
        let mut families = families.into_iter().collect::<Vec<_>>();
        families.sort_unstable();
        families.dedup();
        Self(families)
    }

    pub fn contains(&self, family: u16) -> bool {
        self.0.binary_search(&family).is_ok()
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> + '_ {
        self.0.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// 本连接协商到的 family 和 ClientReady 标志
#[derive(Debug, Default)]
pub(crate) struct CapabilityRegistry {
    families: Option<SnacFamilySet>,
    client_ready: bool,
}

impl CapabilityRegistry {
    /// 只在第一次 ServerReady 时生效，返回是否生效
    pub(crate) fn set_families(&mut self, families: SnacFamilySet) -> bool {
        if self.families.is_some() {
            return false;
        }
        self.families = Some(families);
        true
    }

    /// ServerReady 之前总是返回 false
    pub(crate) fn supports_family(&self, family: u16) -> bool {
        self.families
            .as_ref()
            .map(|families| families.contains(family))
            .unwrap_or(false)
    }

    /// 请求是否写到本连接，否则交给会话层
    pub(crate) fn routes_locally(&self, family: u16) -> bool {
        self.supports_family(family)
    }

    /// 置位 ClientReady，只有第一次调用返回 true
    pub(crate) fn latch_client_ready(&mut self) -> bool {
        !std::mem::replace(&mut self.client_ready, true)
    }

    pub(crate) fn client_ready_sent(&self) -> bool {
        self.client_ready
    }

    /// ClientVersions 和 ClientReady 中声明的各 family 版本
    pub(crate) fn family_infos(&self) -> Vec<FamilyVersion> {
        self.families
            .iter()
            .flat_map(SnacFamilySet::iter)
            .map(FamilyVersion::default_for)
            .collect()
    }
}
