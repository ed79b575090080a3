pub mod aberrations;
pub mod simulate;
