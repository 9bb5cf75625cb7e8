//! Play a notification sound through the audio notifier
//!
//! ```text
//! notify-sound [--list] [--virtual] [--loop <ms>] [--device <index>] [--config <path>] <sound.wav>
//! ```
//!
//! The sound plays once, or loops until Ctrl+C with `--loop`. `--virtual`
//! plays into an in-memory device and reports what would have been written.

use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use neomedia_audio::{
    audio::{CpalAudio, NativeAudio, VirtualAudio},
    config::AppConfig,
    notify::{AudioClip, AudioNotifier},
};

/// Command line options
#[derive(Debug, Default)]
struct Args {
    list: bool,
    virtual_device: bool,
    loop_interval: Option<u64>,
    device: Option<usize>,
    config: Option<PathBuf>,
    sound: Option<String>,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = parse_args()?;

    let mut config = match args.config.clone().or_else(AppConfig::default_path) {
        Some(path) if path.exists() => {
            tracing::info!("Loading config from {}", path.display());
            AppConfig::load(&path).with_context(|| format!("loading {}", path.display()))?
        }
        _ => AppConfig::default(),
    };
    if let Some(device) = args.device {
        config.audio.notify_device = Some(device);
    }
    // the command line always wants to hear the sound
    config.notifier.sound_enabled = true;

    let virtual_audio = args.virtual_device.then(|| Arc::new(VirtualAudio::default()));
    let audio: Arc<dyn NativeAudio> = match &virtual_audio {
        Some(v) => v.clone() as Arc<dyn NativeAudio>,
        None => Arc::new(CpalAudio::new()),
    };

    if args.list {
        print_devices(&*audio);
        return Ok(());
    }

    let Some(sound) = args.sound else {
        bail!("no sound given, see --help");
    };

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .context("installing Ctrl+C handler")?;

    let notifier = AudioNotifier::new(audio.clone(), &config);
    let clip = notifier
        .create_clip(&sound)
        .with_context(|| format!("cannot play {}", sound))?;

    match args.loop_interval {
        Some(interval) => {
            tracing::info!("Looping {} every {} ms, Ctrl+C to stop", sound, interval);
            clip.play_in_loop(interval);
        }
        None => clip.play(),
    }

    while running.load(Ordering::SeqCst) && clip.is_playing() {
        std::thread::sleep(Duration::from_millis(50));
    }

    notifier.destroy_clip(&clip);
    if clip.is_invalid() {
        bail!("playback of {} failed", sound);
    }

    if let Some(v) = virtual_audio {
        println!(
            "Wrote {} buffers ({} bytes) to the virtual device",
            v.written_buffers(),
            v.written_bytes()
        );
    }

    notifier.shutdown();
    Ok(())
}

fn parse_args() -> Result<Args> {
    let mut args = Args::default();
    let mut iter = std::env::args().skip(1);

    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--list" | "-l" => args.list = true,
            "--virtual" => args.virtual_device = true,
            "--loop" => {
                let value = iter.next().context("--loop needs an interval in ms")?;
                args.loop_interval = Some(value.parse().context("invalid --loop interval")?);
            }
            "--device" | "-d" => {
                let value = iter.next().context("--device needs an index")?;
                args.device = Some(value.parse().context("invalid --device index")?);
            }
            "--config" | "-c" => {
                let value = iter.next().context("--config needs a path")?;
                args.config = Some(PathBuf::from(value));
            }
            "--help" | "-h" => {
                println!("notify-sound - play a notification sound");
                println!();
                println!("Usage: notify-sound [OPTIONS] <SOUND>");
                println!();
                println!("Options:");
                println!("  -l, --list            List audio devices");
                println!("      --virtual         Play into an in-memory device");
                println!("      --loop <MS>       Loop with a pause of MS milliseconds (0 = no pause)");
                println!("  -d, --device <INDEX>  Notification device");
                println!("  -c, --config <PATH>   Config file");
                println!("  -h, --help            Show this help");
                std::process::exit(0);
            }
            other if other.starts_with('-') => bail!("unknown option {}", other),
            other => args.sound = Some(other.to_string()),
        }
    }

    Ok(args)
}

fn print_devices(audio: &dyn NativeAudio) {
    println!();
    println!("Audio devices:");
    for device in audio.devices() {
        let mut markers = Vec::new();
        if device.is_default_input {
            markers.push("default input");
        }
        if device.is_default_output {
            markers.push("default output");
        }
        println!(
            "  [{}] {} (in: {}, out: {}, {} Hz){}",
            device.index,
            device.name,
            device.max_input_channels,
            device.max_output_channels,
            device.default_sample_rate,
            if markers.is_empty() {
                String::new()
            } else {
                format!(" [{}]", markers.join(", "))
            }
        );
    }
    println!();
}
