use std::io::Write;

use crossterm::event::{self, Event, KeyCode, KeyModifiers};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};

use sqlcopilot::config::Config;
use sqlcopilot::Engine;

/// Minimal line buffer standing in for a real line editor — just enough to
/// drive the engine end to end.
struct DemoLine {
    buf: String,
    cursor: usize,
}

impl DemoLine {
    fn native_redisplay(&self) {
        print!("\rsql> {}", self.buf);
        let _ = std::io::stdout().flush();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    tracing::info!("sqlcopilot starting");

    let config = Config::from_env()?;
    if !config.auth.is_authenticated() {
        println!("Unable to run ai commands. Authentication required.");
    }

    let mut engine = Engine::start(config, "CREATE TABLE users (\n\tid int\n);\n");

    enable_raw_mode()?;
    let result = run_loop(&mut engine).await;
    disable_raw_mode()?;

    tracing::info!("sqlcopilot shutting down");
    result
}

async fn run_loop(engine: &mut Engine) -> anyhow::Result<()> {
    let mut line = DemoLine {
        buf: String::new(),
        cursor: 0,
    };
    line.native_redisplay();

    loop {
        if !event::poll(std::time::Duration::from_millis(50))? {
            continue;
        }
        let Event::Key(key) = event::read()? else {
            continue;
        };

        match key.code {
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => break,
            KeyCode::Enter => {
                println!();
                line.buf.clear();
                line.cursor = 0;
            }
            KeyCode::Tab => {
                let spliced = engine.accept(line.cursor);
                line.cursor = spliced.len();
                line.buf = spliced;
            }
            KeyCode::Char(c) => {
                line.buf.insert(line.cursor, c);
                line.cursor += 1;
            }
            KeyCode::Backspace if line.cursor > 0 => {
                line.cursor -= 1;
                line.buf.remove(line.cursor);
            }
            _ => continue,
        }

        let needs_redraw = engine.on_event(&line.buf, line.cursor);
        if needs_redraw {
            engine.redraw(|| line.native_redisplay())?;
        } else {
            line.native_redisplay();
        }
    }

    Ok(())
}
