pub mod mask;
pub mod padding;
