use crate::Result;

/// Knowledge about installed snaps the manager needs for conflict checks.
pub trait SnapActivity: Send + Sync {
    /// Snaps whose content is measured during boot (kernel, gadget and
    /// base). Changes to them require a reseal.
    fn relevant_snaps(&self) -> Result<Vec<String>>;
}
