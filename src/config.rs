//! Application configuration file support.
//!
//! This module provides the TOML-backed application configuration: the
//! telescope roster, the galaxy catalog for catalog-driven tiling and the
//! map-acquisition retry policy. The configuration is constructed once at
//! process start and handed to services by reference; built-in defaults
//! cover the five campaign telescopes so the service runs without a file.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::api::Filter;
use crate::models::plan::{FilterScheduleType, PlanArgs, ScheduleStrategy};
use crate::models::telescope::{
    FieldOfView, FileFormat, Galaxy, SchedulerBackend, Telescope,
};

/// Application configuration from file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Root directory for file-drop submissions with relative paths.
    pub data_dir: PathBuf,
    pub acquisition: AcquisitionSettings,
    #[serde(rename = "telescope")]
    pub telescopes: Vec<Telescope>,
    /// Weighted galaxy catalog used by the `catalog` tiling strategy.
    #[serde(rename = "galaxy")]
    pub galaxies: Vec<Galaxy>,
}

/// Retry policy for fetching probability maps from external services.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionSettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: u64,
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
}

fn default_max_attempts() -> u32 {
    20
}

fn default_base_delay_secs() -> u64 {
    1
}

fn default_max_delay_secs() -> u64 {
    60
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_secs: default_base_delay_secs(),
            max_delay_secs: default_max_delay_secs(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            acquisition: AcquisitionSettings::default(),
            telescopes: default_telescopes(),
            galaxies: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Load application configuration from a TOML file.
    ///
    /// # Returns
    /// * `Ok(AppConfig)` if successful
    /// * `Err` if the file cannot be read or parsed
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file {:?}", path.as_ref()))?;
        let config: AppConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {:?}", path.as_ref()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the default location, falling back to the
    /// built-in defaults when no file exists.
    ///
    /// Searches for `marshal.toml` in:
    /// 1. Current directory
    /// 2. `config/` directory
    /// 3. Parent directory
    pub fn from_default_location() -> anyhow::Result<Self> {
        let search_paths = vec![
            PathBuf::from("marshal.toml"),
            PathBuf::from("config/marshal.toml"),
            PathBuf::from("../marshal.toml"),
        ];

        for path in search_paths {
            if path.exists() {
                return Self::from_file(&path);
            }
        }

        Ok(Self::default())
    }

    /// Look up a telescope by name.
    pub fn telescope(&self, name: &str) -> Option<&Telescope> {
        self.telescopes.iter().find(|t| t.name == name)
    }

    fn validate(&self) -> anyhow::Result<()> {
        for telescope in &self.telescopes {
            if telescope.filters.is_empty() {
                anyhow::bail!("telescope '{}' has an empty filter set", telescope.name);
            }
            for filter in &telescope.default_plan_args.filters {
                if !telescope.filters.contains(filter) {
                    anyhow::bail!(
                        "telescope '{}' defaults to filter '{}' it does not have",
                        telescope.name,
                        filter
                    );
                }
            }
        }
        let mut names: Vec<&str> = self.telescopes.iter().map(|t| t.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        if names.len() != self.telescopes.len() {
            anyhow::bail!("duplicate telescope names in configuration");
        }
        Ok(())
    }
}

/// The five campaign telescopes with their standard plan arguments.
pub fn default_telescopes() -> Vec<Telescope> {
    vec![
        Telescope {
            name: "ZTF".to_string(),
            latitude: qtty::Degrees::new(33.3563),
            longitude: qtty::Degrees::new(-116.8650),
            elevation_m: 1712.0,
            timezone: "America/Los_Angeles".to_string(),
            filters: vec![Filter::G, Filter::R, Filter::I],
            fov: FieldOfView::Square {
                side: qtty::Degrees::new(6.86),
            },
            backend: SchedulerBackend::HttpQueue {
                base_url: "http://tunnel:9999".to_string(),
            },
            expand_dithers: false,
            overhead_per_exposure: 10.0,
            program_pi: "Kulkarni".to_string(),
            default_plan_args: PlanArgs {
                filters: vec![Filter::G, Filter::R, Filter::G],
                exposure_times: vec![300.0, 300.0, 300.0],
                do_references: true,
                ..PlanArgs::default()
            },
        },
        Telescope {
            name: "DECam".to_string(),
            latitude: qtty::Degrees::new(-30.1690),
            longitude: qtty::Degrees::new(-70.8063),
            elevation_m: 2207.0,
            timezone: "America/Santiago".to_string(),
            filters: vec![Filter::G, Filter::R, Filter::I, Filter::Z],
            fov: FieldOfView::Circle {
                radius: qtty::Degrees::new(1.1),
            },
            backend: SchedulerBackend::FileDrop {
                dir: PathBuf::from("decam"),
                format: FileFormat::Csv,
            },
            expand_dithers: true,
            overhead_per_exposure: 30.0,
            program_pi: "Andreoni/Goldstein".to_string(),
            default_plan_args: PlanArgs {
                filters: vec![Filter::G, Filter::Z],
                exposure_times: vec![25.0, 25.0],
                do_references: true,
                do_dither: true,
                schedule_type: "greedy_slew".to_string(),
                filter_schedule: FilterScheduleType::Integrated,
                ..PlanArgs::default()
            },
        },
        Telescope {
            name: "Gattini".to_string(),
            latitude: qtty::Degrees::new(33.3563),
            longitude: qtty::Degrees::new(-116.8650),
            elevation_m: 1712.0,
            timezone: "America/Los_Angeles".to_string(),
            filters: vec![Filter::J],
            fov: FieldOfView::Square {
                side: qtty::Degrees::new(4.96),
            },
            backend: SchedulerBackend::FileDrop {
                dir: PathBuf::from("gattini"),
                format: FileFormat::Json,
            },
            expand_dithers: false,
            overhead_per_exposure: 0.0,
            program_pi: "Kasliwal".to_string(),
            default_plan_args: PlanArgs {
                filters: vec![Filter::J],
                exposure_times: vec![300.0],
                ..PlanArgs::default()
            },
        },
        Telescope {
            name: "KPED".to_string(),
            latitude: qtty::Degrees::new(31.9599),
            longitude: qtty::Degrees::new(-111.5997),
            elevation_m: 2099.0,
            timezone: "America/Phoenix".to_string(),
            filters: vec![Filter::U, Filter::G, Filter::R, Filter::I],
            fov: FieldOfView::Circle {
                radius: qtty::Degrees::new(0.0367),
            },
            backend: SchedulerBackend::FileDrop {
                dir: PathBuf::from("kped"),
                format: FileFormat::Json,
            },
            expand_dithers: false,
            overhead_per_exposure: 0.0,
            program_pi: "Coughlin".to_string(),
            default_plan_args: PlanArgs {
                filters: vec![Filter::R],
                exposure_times: vec![300.0],
                filter_schedule: FilterScheduleType::Integrated,
                strategy: ScheduleStrategy::Catalog,
                ..PlanArgs::default()
            },
        },
        Telescope {
            name: "GROWTH-India".to_string(),
            latitude: qtty::Degrees::new(32.7794),
            longitude: qtty::Degrees::new(78.9642),
            elevation_m: 4500.0,
            timezone: "Asia/Kolkata".to_string(),
            filters: vec![Filter::G, Filter::R, Filter::I, Filter::Z],
            fov: FieldOfView::Square {
                side: qtty::Degrees::new(0.7),
            },
            backend: SchedulerBackend::FileDrop {
                dir: PathBuf::from("growth-india"),
                format: FileFormat::Json,
            },
            expand_dithers: false,
            overhead_per_exposure: 10.0,
            program_pi: "Bhalerao".to_string(),
            default_plan_args: PlanArgs {
                filters: vec![Filter::R],
                exposure_times: vec![300.0],
                filter_schedule: FilterScheduleType::Integrated,
                strategy: ScheduleStrategy::Catalog,
                ..PlanArgs::default()
            },
        },
    ]
}
