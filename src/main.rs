mod app;
mod map;
mod state;
mod style;

use anyhow::Context;
use winit::event_loop::EventLoop;

use app::App;

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let api_key = std::env::var("MAPTILER_KEY")
        .context("MAPTILER_KEY environment variable must be set")?;

    let event_loop = EventLoop::new()?;
    let mut app = App::new(api_key);
    event_loop.run_app(&mut app)?;

    Ok(())
}
