mod local;

pub use local::LocalStorage;
