mod app;
mod transform;

pub use app::add_routes;
