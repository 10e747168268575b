//! Configuration for the Agnus/Copper timing core.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgnusModel {
    A500,
    A1000,
    A2000,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgnusConfig {
    pub model: AgnusModel,
}

impl Default for AgnusConfig {
    fn default() -> Self {
        Self { model: AgnusModel::A500 }
    }
}
