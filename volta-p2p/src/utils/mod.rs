pub mod averager;

pub use averager::Averager;
