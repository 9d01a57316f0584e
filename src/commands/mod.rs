pub mod machine;
pub mod precompute;
pub mod route;

pub use machine::handle_machine;
pub use precompute::handle_precompute;
pub use route::handle_route;
