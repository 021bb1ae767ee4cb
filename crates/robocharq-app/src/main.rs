slint::include_modules!();

mod settings;

use anyhow::{Context, Result};
use robocharq_core::race_clock::TICK_INTERVAL;
use robocharq_core::{DisplayLoop, LinkConfig, LinkEvent, RaceClock, SensorLink};
use settings::Settings;
use std::cell::{Cell, RefCell};
use std::path::PathBuf;
use std::rc::Rc;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let (settings, source) = Settings::load(std::env::args_os().nth(1).map(PathBuf::from))?;
    if let Some(path) = &source {
        log::info!("settings loaded from {}", path.display());
    }

    let link_config = settings.link_config().context("invalid sensor bits")?;
    let clock = RaceClock::with_options(settings.resume_mode()?, TICK_INTERVAL);
    let display = DisplayLoop::new(clock.clone(), settings.refresh());

    let app = MainWindow::new()?;
    app.set_font_size(settings.fontsize);
    let fullscreen = Rc::new(Cell::new(settings.fullscreen));
    app.window().set_fullscreen(fullscreen.get());

    let sensor_link: Rc<RefCell<Option<SensorLink>>> = Rc::new(RefCell::new(None));
    connect(&app, &sensor_link, &link_config, &clock);
    if source.is_none() {
        app.set_config_hint(settings::FORMAT_HINT.into());
    }

    // Quit
    app.on_quit(|| {
        let _ = slint::quit_event_loop();
    });

    // Arm: back to idle, waiting for the start sensor
    {
        let clock = clock.clone();
        app.on_arm(move || {
            if let Err(e) = clock.reset() {
                log::warn!("arm ignored: {e}");
            }
        });
    }

    // Manual pause/resume
    {
        let clock = clock.clone();
        app.on_pause_resume(move || match clock.toggle() {
            Ok(state) => log::info!("manual toggle -> {state:?}"),
            Err(e) => log::warn!("toggle ignored: {e}"),
        });
    }

    // Fullscreen toggle
    {
        let app_weak = app.as_weak();
        let fullscreen = fullscreen.clone();
        app.on_toggle_fullscreen(move || {
            let app = app_weak.unwrap();
            fullscreen.set(!fullscreen.get());
            app.window().set_fullscreen(fullscreen.get());
        });
    }

    // Reconnect after a link failure
    {
        let app_weak = app.as_weak();
        let sensor_link = sensor_link.clone();
        let link_config = link_config.clone();
        let clock = clock.clone();
        app.on_reconnect(move || {
            let app = app_weak.unwrap();
            if sensor_link.borrow().as_ref().is_some_and(SensorLink::is_open) {
                return;
            }
            sensor_link.borrow_mut().take();
            connect(&app, &sensor_link, &link_config, &clock);
        });
    }

    // Display refresh
    let app_weak = app.as_weak();
    let sensor_link_clone = sensor_link.clone();

    let refresh = display.refresh();
    let _timer = slint::Timer::default();
    _timer.start(slint::TimerMode::Repeated, refresh, move || {
        let app = app_weak.unwrap();
        let frame = display.sample();
        let (r, g, b) = frame.tone.rgb();
        app.set_time_text(frame.text.into());
        app.set_time_color(slint::Color::from_rgb_u8(r, g, b));

        let events: Vec<LinkEvent> = match sensor_link_clone.borrow().as_ref() {
            Some(link) => link.events().try_iter().collect(),
            None => Vec::new(),
        };
        for event in events {
            match event {
                LinkEvent::Failed(e) => {
                    app.set_status_text(format!("Sensores desconectados: {e} (R para reconectar)").into());
                }
                LinkEvent::Closed => {
                    sensor_link_clone.borrow_mut().take();
                }
            }
        }
    });

    let run = app.run();

    if let Some(link) = sensor_link.borrow_mut().take() {
        link.close();
    }
    clock.terminate()?;
    run?;
    Ok(())
}

fn connect(
    app: &MainWindow,
    slot: &RefCell<Option<SensorLink>>,
    cfg: &LinkConfig,
    clock: &RaceClock,
) {
    match SensorLink::open(cfg.clone(), clock.clone()) {
        Ok(link) => {
            *slot.borrow_mut() = Some(link);
            app.set_status_text("".into());
        }
        Err(e) => {
            log::error!("{e}; available ports: {:?}", SensorLink::list_ports());
            app.set_status_text(format!("Sensores indisponíveis: {e} (R para reconectar)").into());
        }
    }
}
