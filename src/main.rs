mod application;
mod scene_description;

use application::{Application, PathTracerDelegate};
use renderer::config::RendererConfig;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    Application::new(Box::new(PathTracerDelegate::new(RendererConfig::default()))).run()
}
