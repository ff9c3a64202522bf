// src/lib.rs
pub mod app;
pub mod classifier;
pub mod config;
pub mod detector;
pub mod error;
pub mod keypoints;
pub mod render;
pub mod skeleton;
pub mod tracking;
pub mod video;
