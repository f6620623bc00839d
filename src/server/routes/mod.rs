pub mod feedback;
pub mod model;
pub mod predict;
