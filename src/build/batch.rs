//! Run every weapon of a class through the pipeline and report the results.
//!
//! Each successful archive is renamed to `<ordinal>_<weapon>.vpk` so a whole class can be
//! installed and checked in game one after another.

use std::path::{Path, PathBuf};

use bon::Builder;
use rootcause::prelude::*;
use serde::Serialize;
use tracing::{info, warn};

use crate::build::pipeline::{BuildRequest, Pipeline, TracingProgress};
use crate::catalog::{BuildTarget, PlayerClass, WeaponSlot, weapons_for};
use crate::export::package::move_file;
use crate::export::texture::TextureFormat;

#[derive(Debug, Clone, Builder)]
pub struct BatchOptions {
    pub class: PlayerClass,
    #[builder(into)]
    pub image: PathBuf,
    #[builder(into)]
    pub game_root: PathBuf,
    /// Merged into every weapon when set.
    #[builder(into)]
    pub replacement_geometry: Option<PathBuf>,
    #[builder(default = (512, 512))]
    pub resolution: (u32, u32),
    #[builder(default = TextureFormat::Dxt5)]
    pub format: TextureFormat,
    #[builder(default)]
    pub keep_temp_on_error: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Passed,
    Failed,
}

/// One row of the batch report.
#[derive(Debug, Clone, Serialize)]
pub struct BatchRecord {
    pub ordinal: usize,
    pub class: PlayerClass,
    pub slot: WeaponSlot,
    pub weapon: String,
    pub status: BatchStatus,
    /// Final archive path, empty on failure.
    pub output: String,
    pub message: String,
}

#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub records: Vec<BatchRecord>,
}

impl BatchReport {
    pub fn passed(&self) -> usize {
        self.records
            .iter()
            .filter(|record| record.status == BatchStatus::Passed)
            .count()
    }

    pub fn failed(&self) -> usize {
        self.records.len() - self.passed()
    }

    /// Write the report as CSV with a header row.
    pub fn write_csv(&self, path: &Path) -> Result<(), Report> {
        let mut writer = csv::Writer::from_path(path)
            .context_with(|| format!("Failed to create report {}", path.display()))?;
        for record in &self.records {
            writer
                .serialize(record)
                .context_with(|| format!("Failed to write report row for {}", record.weapon))?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// File name a successful build is renamed to.
pub fn ordinal_file_name(ordinal: usize, weapon_key: &str) -> String {
    format!("{ordinal:02}_{weapon_key}.vpk")
}

/// Build every weapon of `options.class` in catalog order.
///
/// Individual failures are recorded and the run continues. `on_record` is called after
/// each weapon with the number of weapons in the run.
pub fn run_batch(
    pipeline: &Pipeline,
    options: &BatchOptions,
    mut on_record: impl FnMut(&BatchRecord, usize),
) -> Result<BatchReport, Report> {
    if !options.image.is_file() {
        bail!("Batch image not found: {}", options.image.display());
    }
    let weapons: Vec<_> = weapons_for(options.class).collect();
    if weapons.is_empty() {
        bail!("No weapons in the catalog for {}", options.class);
    }
    let export_dir = &pipeline.paths().export_dir;
    info!("batch: {} weapons for {}", weapons.len(), options.class);

    let mut report = BatchReport::default();
    for (index, (slot, weapon)) in weapons.iter().enumerate() {
        let ordinal = index + 1;
        let request = BuildRequest::builder()
            .image(options.image.clone())
            .target(BuildTarget::weapon(options.class, weapon.key))
            .resolution(options.resolution)
            .format(options.format)
            .file_name(format!("batch_{}_{}.vpk", options.class, weapon.key))
            .game_root(options.game_root.clone())
            .keep_temp_on_error(options.keep_temp_on_error)
            .geometry_replacement(options.replacement_geometry.is_some())
            .maybe_replacement_geometry(options.replacement_geometry.clone())
            .build();

        let (status, output, message) = match pipeline.run(&request, &TracingProgress, None) {
            Ok(outcome) => {
                let renamed = export_dir.join(ordinal_file_name(ordinal, weapon.key));
                match move_file(&outcome.archive, &renamed) {
                    Ok(()) => (
                        BatchStatus::Passed,
                        renamed.display().to_string(),
                        outcome.model_path.unwrap_or_default(),
                    ),
                    Err(e) => (
                        BatchStatus::Failed,
                        outcome.archive.display().to_string(),
                        format!("built but could not rename: {e}"),
                    ),
                }
            }
            Err(failure) => {
                warn!("batch: {} failed: {}", weapon.key, failure.error);
                (BatchStatus::Failed, String::new(), failure.to_string())
            }
        };

        let record = BatchRecord {
            ordinal,
            class: options.class,
            slot: *slot,
            weapon: weapon.key.to_string(),
            status,
            output,
            message,
        };
        on_record(&record, weapons.len());
        report.records.push(record);
    }

    info!("batch: {} passed, {} failed", report.passed(), report.failed());
    Ok(report)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::paths::ApplicationPaths;
    use crate::settings::PipelineSettings;

    #[test]
    fn ordinal_names_are_zero_padded() {
        assert_eq!(ordinal_file_name(3, "c_bat"), "03_c_bat.vpk");
        assert_eq!(ordinal_file_name(12, "c_bat"), "12_c_bat.vpk");
    }

    #[test]
    fn failures_are_recorded_per_weapon() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("skin.png");
        std::fs::write(&image, b"x").unwrap();
        let pipeline = Pipeline::new(ApplicationPaths::from_root(dir.path()), PipelineSettings::default());
        let options = BatchOptions::builder()
            .class(PlayerClass::Medic)
            .image(&image)
            .game_root(dir.path().join("game"))
            .build();

        let mut seen = 0;
        let report = run_batch(&pipeline, &options, |_, total| {
            seen += 1;
            assert!(seen <= total);
        })
        .unwrap();

        assert_eq!(report.records.len(), weapons_for(PlayerClass::Medic).count());
        assert_eq!(seen, report.records.len());
        assert_eq!(report.passed(), 0);
        assert!(report.records.iter().all(|r| r.message.contains("not found")));
        assert_eq!(report.records[0].ordinal, 1);

        let csv_path = dir.path().join("report.csv");
        report.write_csv(&csv_path).unwrap();
        let text = std::fs::read_to_string(&csv_path).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("ordinal,class,slot,weapon,status,output,message"));
        assert!(lines.next().unwrap().starts_with("1,medic,Primary,"));
    }

    #[test]
    fn missing_image_aborts_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Pipeline::new(ApplicationPaths::from_root(dir.path()), PipelineSettings::default());
        let options = BatchOptions::builder()
            .class(PlayerClass::Scout)
            .image(dir.path().join("nope.png"))
            .game_root(dir.path())
            .build();
        assert!(run_batch(&pipeline, &options, |_, _| {}).is_err());
    }
}
