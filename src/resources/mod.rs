pub mod crd;
pub mod entity;
pub mod labels;
pub mod sparkapplications;
pub mod sparkclusters;
pub mod sparkhistoryservers;
pub mod status;
