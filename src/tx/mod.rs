/// Script templates
pub mod script;
/// Transaction assembly and the state-index codec
pub mod tx;
