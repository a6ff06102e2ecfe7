//! facemesh: build, rig and clean up face meshes from the command line.
//!
//! Landmarks come from a JSON recording of a face-mesh model
//! (`{"landmarks": [...]}` or `{"frames": [...]}`), or from the ONNX model
//! configured under `detector.model_path` when built with `--features onnx`.
//!
//! Set `RUST_LOG` to control log output, e.g. `RUST_LOG=facemesh_pipeline=debug`.

use std::path::{Path, PathBuf};
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use image::ImageFormat;
use nalgebra::Point3;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use facemesh_pipeline::config::config::PipelineConfig;
use facemesh_pipeline::modules::bone_mapper::{Armature, EyePlacement, SceneMesh};
use facemesh_pipeline::modules::cleanup::CleanupOp;
use facemesh_pipeline::modules::landmark_detector::{LandmarkDetector, SidecarLandmarkDetector};
use facemesh_pipeline::modules::mesh_io::read_obj;
use facemesh_pipeline::modules::rig_validation::resolve_generated_rig;
use facemesh_pipeline::modules::mocap::{FrameSource, ImageSequenceSource, StillImageSource};
use facemesh_pipeline::pipeline::pipeline::FacemeshPipeline;

#[derive(Parser)]
#[command(name = "facemesh")]
#[command(author, version, about = "Face photo to rigged 3D mesh", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Pipeline configuration (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Reconstruct a textured mesh from a face photo
    Build {
        /// Input image
        image: PathBuf,

        /// Recorded landmarks (default: the configured model, else
        /// <image stem>.landmarks.json)
        #[arg(long)]
        landmarks: Option<PathBuf>,
    },

    /// Snap armature bones onto a reconstructed mesh
    Rig {
        /// Reconstructed face mesh
        mesh: PathBuf,

        /// Armature JSON
        armature: PathBuf,

        /// Left eye origin as x,y,z
        #[arg(long, value_parser = parse_point)]
        eye_left: Option<Point3<f64>>,

        /// Right eye origin as x,y,z
        #[arg(long, value_parser = parse_point)]
        eye_right: Option<Point3<f64>>,

        /// Where to write the updated armature (default: in place)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Edit the mesh topology in place
    Cleanup {
        /// Face mesh to edit
        mesh: PathBuf,

        /// Edit to apply
        op: CleanupCommand,
    },

    /// Capture face landmarks from a still image, a frame directory or a video
    Capture {
        /// Image file, directory of frames or video file
        path: Option<PathBuf>,

        /// Camera index for live capture
        #[arg(long)]
        camera: Option<i32>,

        /// Recorded landmarks, one entry per frame (default: the configured model)
        #[arg(long)]
        landmarks: Option<PathBuf>,

        /// Export captured frames as a .npy array
        #[arg(long)]
        npy: Option<PathBuf>,

        /// Metarig whose generated rig the capture drives
        #[arg(long)]
        metarig: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum CleanupCommand {
    OpenEyes,
    CloseEyes,
    OpenMouth,
    CloseMouth,
    Symmetrize,
    SmartSymmetrize,
}

impl From<CleanupCommand> for CleanupOp {
    fn from(cmd: CleanupCommand) -> Self {
        match cmd {
            CleanupCommand::OpenEyes => CleanupOp::OpenEyes,
            CleanupCommand::CloseEyes => CleanupOp::CloseEyes,
            CleanupCommand::OpenMouth => CleanupOp::OpenMouth,
            CleanupCommand::CloseMouth => CleanupOp::CloseMouth,
            CleanupCommand::Symmetrize => CleanupOp::Symmetrize,
            CleanupCommand::SmartSymmetrize => CleanupOp::SmartSymmetrize,
        }
    }
}

fn parse_point(s: &str) -> std::result::Result<Point3<f64>, String> {
    let values: Vec<f64> = s
        .split(',')
        .map(|v| v.trim().parse::<f64>().map_err(|e| format!("'{}': {}", v, e)))
        .collect::<std::result::Result<_, _>>()?;
    match values.as_slice() {
        [x, y, z] => Ok(Point3::new(*x, *y, *z)),
        _ => Err(format!("expected x,y,z, got {} values", values.len())),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .with(filter)
        .init();
}

fn default_landmarks_path(image: &Path) -> PathBuf {
    image.with_extension("landmarks.json")
}

fn landmark_detector(config: &PipelineConfig, recorded: Option<PathBuf>) -> Result<Box<dyn LandmarkDetector>> {
    if let Some(path) = recorded {
        let detector = SidecarLandmarkDetector::from_file(&path)
            .with_context(|| format!("could not read landmarks {:?}", path))?;
        return Ok(Box::new(detector))
    }
    match &config.detector.model_path {
        #[cfg(feature = "onnx")]
        Some(model) => {
            let detector = facemesh_pipeline::modules::face_mesh_model::OnnxFaceMeshDetector::load(model, config.detector.clone())
                .with_context(|| format!("could not load landmark model {:?}", model))?;
            Ok(Box::new(detector))
        }
        #[cfg(not(feature = "onnx"))]
        Some(model) => bail!("landmark model {:?} requires the `onnx` feature", model),
        None => bail!("give --landmarks or configure detector.model_path"),
    }
}

fn open_source(path: Option<&Path>, camera: Option<i32>) -> Result<Box<dyn FrameSource>> {
    match (path, camera) {
        (Some(path), None) if path.is_dir() => Ok(Box::new(ImageSequenceSource::from_dir(path)?)),
        (Some(path), None) if ImageFormat::from_path(path).is_ok() => Ok(Box::new(StillImageSource::new(path))),
        #[cfg(feature = "opencv")]
        (Some(path), None) => {
            let input = facemesh_pipeline::config::config::CaptureInput::File(path.to_path_buf());
            Ok(Box::new(facemesh_pipeline::modules::mocap::VideoCaptureSource::open(&input)?))
        }
        #[cfg(feature = "opencv")]
        (None, Some(index)) => {
            let input = facemesh_pipeline::config::config::CaptureInput::Camera(index);
            Ok(Box::new(facemesh_pipeline::modules::mocap::VideoCaptureSource::open(&input)?))
        }
        #[cfg(not(feature = "opencv"))]
        (Some(path), None) => bail!("{:?} is not an image; video input requires the `opencv` feature", path),
        #[cfg(not(feature = "opencv"))]
        (None, Some(_)) => bail!("live camera capture requires the `opencv` feature"),
        _ => bail!("give either a capture path or --camera"),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let mut config = match &cli.config {
        Some(path) => PipelineConfig::from_file(path).with_context(|| format!("could not read config {:?}", path))?,
        None => PipelineConfig::new(),
    };

    match cli.command {
        Commands::Build { image, landmarks } => {
            let recorded = landmarks.or_else(|| {
                config.detector.model_path.is_none().then(|| default_landmarks_path(&image))
            });
            let detector = landmark_detector(&config, recorded)?;
            let pipeline = FacemeshPipeline::new(config, detector)?;
            let artifacts = pipeline.image_to_facemesh(&image)?;
            println!("{}", artifacts.obj_path.display());
        }
        Commands::Rig { mesh, armature, eye_left, eye_right, output } => {
            let pipeline = FacemeshPipeline::new(config, Box::new(SidecarLandmarkDetector::new(Vec::new())))?;
            let obj = read_obj(&mesh).with_context(|| format!("could not read mesh {:?}", mesh))?;
            let scene_mesh = SceneMesh::new(obj.vertices.iter().map(|v| Point3::new(v[0], v[1], v[2])).collect());
            let mut rig = Armature::from_file(&armature).with_context(|| format!("could not read armature {:?}", armature))?;

            let eyes = EyePlacement { left: eye_left, right: eye_right };
            let report = pipeline.rig_facemesh(&scene_mesh, Some(&mut rig), &eyes)?;
            let output = output.unwrap_or(armature);
            rig.save(&output)?;
            info!("wrote {:?}", output);
            for eye in report.missing_eyes {
                println!("{} needs manual placement", eye);
            }
        }
        Commands::Cleanup { mesh, op } => {
            let pipeline = FacemeshPipeline::new(config, Box::new(SidecarLandmarkDetector::new(Vec::new())))?;
            let edited = pipeline.cleanup_file(&mesh, op.into())?;
            println!("{}: {} faces", mesh.display(), edited.faces.len());
        }
        Commands::Capture { path, camera, landmarks, npy, metarig } => {
            if npy.is_some() {
                config.capture.npy_export = npy;
            }
            if let Some(metarig_path) = metarig {
                let metarig = Armature::from_file(&metarig_path)
                    .with_context(|| format!("could not read armature {:?}", metarig_path))?;
                let target = resolve_generated_rig(Some(&metarig))?;
                info!("capturing for rig '{}' generated from '{}'", target, metarig.name);
            }
            let detector = landmark_detector(&config, landmarks)?;
            let mut source = open_source(path.as_deref(), camera)?;
            let pipeline = FacemeshPipeline::new(config, detector)?;
            let report = pipeline.capture(source.as_mut())?;
            println!(
                "{} frames, {} faces, {} skipped",
                report.frames_read, report.faces.len(), report.frames_skipped
            );
        }
    }
    Ok(())
}
