use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use doorwatch_core::gallery::{list_images, person_directories};
use doorwatch_core::{Config, FaceAnalyzer, FaceGallery, GalleryLock, OnnxFaceAnalyzer, Paths};
use doorwatch_media::{CaptureWindow, FrameSource};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "doorwatch", about = "Doorwatch face gallery management")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Rebuild the gallery from every person folder under known_faces/
    AddAll,
    /// Encode one person's folder and append it to the gallery
    Add {
        /// Person folder name under known_faces/
        person: String,
    },
    /// Remove every encoding for a person
    Remove { person: String },
    /// Show per-person encoding counts
    Stats,
    /// List known persons
    List,
    /// Capture training images of a person from the camera
    Capture {
        person: String,
        /// How long to record
        #[arg(short, long, default_value_t = 5.0)]
        seconds: f64,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load().context("loading configuration")?;
    let paths = &config.paths;

    match cli.command {
        Commands::AddAll => {
            let _lock = GalleryLock::acquire(&paths.gallery_store)?;
            let dirs = person_directories(&paths.known_faces_dir)
                .with_context(|| format!("reading {}", paths.known_faces_dir.display()))?;
            let mut analyzer = load_analyzer(paths)?;
            let (gallery, report) = FaceGallery::rebuild_all(&paths.gallery_store, &dirs, &mut analyzer)?;

            for (person, count) in gallery.stats().per_person {
                println!("  {person}: {count} encoding(s)");
            }
            println!(
                "Saved {} encodings for {} person(s), {} image(s) skipped",
                report.added,
                dirs.len(),
                report.skipped
            );
        }
        Commands::Add { person } => {
            let Some(images) = person_images(paths, &person)? else {
                println!("No folder for '{person}' at {}", paths.person_dir(&person).display());
                return Ok(());
            };

            let _lock = GalleryLock::acquire(&paths.gallery_store)?;
            let mut gallery = FaceGallery::load(&paths.gallery_store)?;
            let mut analyzer = load_analyzer(paths)?;
            let report = gallery.add_person(&person, &images, &mut analyzer)?;

            if report.added == 0 {
                println!("No encodings for {person} ({} image(s) skipped), gallery unchanged", report.skipped);
            } else {
                println!(
                    "Added {} encoding(s) for {person}, {} image(s) skipped, {} total",
                    report.added,
                    report.skipped,
                    gallery.len()
                );
            }
        }
        Commands::Remove { person } => {
            let _lock = GalleryLock::acquire(&paths.gallery_store)?;
            let mut gallery = FaceGallery::load(&paths.gallery_store)?;
            match gallery.remove_person(&person)? {
                0 => println!("No encodings found for '{person}'"),
                n => println!("Removed {n} encoding(s) for '{person}'"),
            }
        }
        Commands::Stats => {
            let Some(gallery) = load_existing(paths)? else {
                return Ok(());
            };
            let stats = gallery.stats();
            println!("Face encoding stats:");
            for (person, count) in &stats.per_person {
                println!("  {person}: {count} image(s)");
            }
            println!("Total known persons: {}", stats.persons);
            println!("Total encodings: {}", stats.total);
        }
        Commands::List => {
            let Some(gallery) = load_existing(paths)? else {
                return Ok(());
            };
            println!("Known persons:");
            for name in gallery.names() {
                println!("  {name}");
            }
        }
        Commands::Capture { person, seconds } => {
            let duration = match Duration::try_from_secs_f64(seconds) {
                Ok(d) if !d.is_zero() => d,
                _ => bail!("--seconds must be a positive number of seconds"),
            };
            capture(&config, &person, duration)?;
        }
    }

    Ok(())
}

fn load_analyzer(paths: &Paths) -> Result<OnnxFaceAnalyzer> {
    OnnxFaceAnalyzer::load(&paths.detector_model(), &paths.recognizer_model()).context("loading face models")
}

/// Training images for `person`; `None` when the person has no folder.
fn person_images(paths: &Paths, person: &str) -> Result<Option<Vec<PathBuf>>> {
    let dir = paths.person_dir(person);
    if !dir.is_dir() {
        return Ok(None);
    }
    Ok(Some(list_images(&dir)?))
}

/// Gallery for read-only commands; `None` (with a message) when no store exists yet.
fn load_existing(paths: &Paths) -> Result<Option<FaceGallery>> {
    if !paths.gallery_store.exists() {
        println!("No gallery at {}", paths.gallery_store.display());
        return Ok(None);
    }
    Ok(Some(FaceGallery::load(&paths.gallery_store)?))
}

/// Record from the camera and keep frames that contain at least one face.
fn capture(config: &Config, person: &str, duration: Duration) -> Result<()> {
    let dir = config.paths.person_dir(person);
    std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;

    let mut analyzer = load_analyzer(&config.paths)?;
    let mut source = config.frame_source()?;
    println!("Capturing {person} for {:.1}s, look at the camera", duration.as_secs_f64());
    let batch = source
        .acquire(CaptureWindow::Duration(duration), config.stream.fps)
        .context("capturing frames")?;

    let mut saved = 0;
    for frame in batch.frames() {
        let faces = match analyzer.analyze(frame) {
            Ok(result) => result.encodings.len(),
            Err(e) => {
                tracing::warn!(sequence = frame.sequence(), error = %e, "analysis failed, frame dropped");
                continue;
            }
        };
        if faces == 0 {
            continue;
        }
        let name = format!(
            "{}_{:04}.jpg",
            frame.captured_at().format("%Y%m%d_%H%M%S_%3f"),
            frame.sequence()
        );
        let path = dir.join(name);
        frame
            .image()
            .save(&path)
            .with_context(|| format!("writing {}", path.display()))?;
        saved += 1;
    }

    println!("Saved {saved} of {} frame(s) to {}", batch.len(), dir.display());
    if saved > 0 {
        println!("Run `doorwatch add {person}` to encode them");
    }
    Ok(())
}
