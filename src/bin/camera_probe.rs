use pose_overlay::config::AppConfig;
use pose_overlay::video::{CameraSource, FrameSource, VideoConfig};

fn main() {
    tracing_subscriber::fmt::init();
    println!("Testing camera access...\n");

    match nokhwa::query(nokhwa::utils::ApiBackend::Auto) {
        Ok(cameras) => {
            println!("Found {} camera(s):", cameras.len());
            for camera in &cameras {
                println!("  [{}] {}", camera.index(), camera.human_name());
            }
        }
        Err(e) => println!("Failed to query cameras: {}", e),
    }

    let config = match AppConfig::load() {
        Ok(config) => config.video,
        Err(e) => {
            println!("Config unreadable ({:#}), probing with defaults", e);
            VideoConfig::default()
        }
    };

    match CameraSource::open(&config) {
        Ok(mut camera) => {
            println!("✓ Stream opened on {}", camera.describe());
            match camera.read_frame() {
                Ok(frame) => println!("✓ Frame captured: {}x{}", frame.width(), frame.height()),
                Err(e) => println!("✗ {}", e),
            }
        }
        Err(e) => {
            println!("✗ {}", e);
            println!("\nPossible causes:");
            println!("1. Camera is being used by another app");
            println!("2. Camera permissions not granted");
            println!("3. No camera connected");
        }
    }
}
