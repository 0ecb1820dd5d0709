//! Stage orchestration and working-directory layout.
//!
//! An `Engine` owns the validated configuration and the location of
//! every intermediate file; stages receive it by reference. Each stage
//! leaves its output files in place so a failed run can be resumed from
//! the failing stage.

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use log::info;

use crate::config::Config;
use crate::pipeline;

/// The pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    PrepTargets = 1,
    PrepReads = 2,
    SortReads = 3,
    WindowReads = 4,
    SortWindows = 5,
    Bloom = 6,
    SortBloom = 7,
    MergeBloom = 8,
    CombineWindows = 9,
    JoinGeneNames = 10,
    JoinReadNames = 11,
}

impl Stage {
    pub const ALL: [Stage; 11] = [
        Stage::PrepTargets,
        Stage::PrepReads,
        Stage::SortReads,
        Stage::WindowReads,
        Stage::SortWindows,
        Stage::Bloom,
        Stage::SortBloom,
        Stage::MergeBloom,
        Stage::CombineWindows,
        Stage::JoinGeneNames,
        Stage::JoinReadNames,
    ];

    /// Resolve a 1-based stage number from the command line.
    pub fn from_number(n: u32) -> Result<Stage> {
        Stage::ALL
            .get(n.checked_sub(1).unwrap_or(u32::MAX) as usize)
            .copied()
            .ok_or_else(|| anyhow::anyhow!("start point {} is out of range 1..=11", n))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Stage::PrepTargets => "prep-targets",
            Stage::PrepReads => "prep-reads",
            Stage::SortReads => "sort-reads",
            Stage::WindowReads => "window-reads",
            Stage::SortWindows => "sort-windows",
            Stage::Bloom => "bloom",
            Stage::SortBloom => "sort-bloom",
            Stage::MergeBloom => "merge-bloom",
            Stage::CombineWindows => "combine-windows",
            Stage::JoinGeneNames => "join-gene-names",
            Stage::JoinReadNames => "join-read-names",
        }
    }
}

/// Owns the configuration and drives the stages.
pub struct Engine {
    config: Config,
    work_dir: PathBuf,
}

impl Engine {
    /// Validate the configuration and prepare the working directory.
    ///
    /// The working directory defaults to a `tmp` directory next to the
    /// read file; `temp_dir` overrides it.
    pub fn new(config: Config) -> Result<Engine> {
        config.validate()?;
        let work_dir = match &config.temp_dir {
            Some(dir) => dir.clone(),
            None => {
                let parent = config.read_file.parent().unwrap_or(std::path::Path::new("."));
                parent.join("tmp")
            }
        };
        std::fs::create_dir_all(&work_dir)
            .with_context(|| format!("failed to create working directory {}", work_dir.display()))?;
        Ok(Engine { config, work_dir })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn work_dir(&self) -> &std::path::Path {
        &self.work_dir
    }

    // Intermediate file layout. Names are stable so that a rerun with
    // --StartPoint can pick up where a failed run stopped.

    pub fn targets_path(&self) -> PathBuf {
        self.work_dir.join("targets.txt.gz")
    }

    pub fn reads_path(&self) -> PathBuf {
        self.work_dir.join("reads.txt.gz")
    }

    pub fn reads_sorted_path(&self) -> PathBuf {
        self.work_dir.join("reads_sorted.txt.gz")
    }

    pub fn win_path(&self, k: usize) -> PathBuf {
        self.work_dir.join(format!("win_{}.txt.gz", k))
    }

    pub fn win_sorted_path(&self, k: usize) -> PathBuf {
        self.work_dir.join(format!("win_{}_sorted.txt.gz", k))
    }

    pub fn bmatch_path(&self, k: usize) -> PathBuf {
        self.work_dir.join(format!("bmatch_{}.txt.gz", k))
    }

    pub fn smatch_path(&self, k: usize) -> PathBuf {
        self.work_dir.join(format!("smatch_{}.txt.gz", k))
    }

    pub fn rmatch_path(&self, k: usize) -> PathBuf {
        self.work_dir.join(format!("rmatch_{}.txt.gz", k))
    }

    pub fn matches_path(&self) -> PathBuf {
        self.work_dir.join("matches.txt.gz")
    }

    pub fn matches_best_path(&self) -> PathBuf {
        self.work_dir.join("matches_best.txt.gz")
    }

    pub fn matches_sg_path(&self) -> PathBuf {
        self.work_dir.join("matches_sg.txt.gz")
    }

    pub fn matches_sn_path(&self) -> PathBuf {
        self.work_dir.join("matches_sn.txt.gz")
    }

    /// The final plain-text output, next to the read file.
    pub fn final_output_path(&self) -> PathBuf {
        let stem = self
            .config
            .read_file
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "reads".to_string());
        let parent = self
            .config
            .read_file
            .parent()
            .unwrap_or(std::path::Path::new("."));
        parent.join(format!("{}_matches.txt", stem))
    }

    /// Run the whole pipeline.
    pub fn run(&self) -> Result<()> {
        self.run_from(Stage::PrepTargets)
    }

    /// Run the pipeline starting at the given stage.
    pub fn run_from(&self, start: Stage) -> Result<()> {
        for stage in Stage::ALL {
            if stage < start {
                continue;
            }
            let begun = Instant::now();
            info!("stage {}: starting", stage.name());
            self.run_stage(stage)
                .with_context(|| format!("stage {} failed", stage.name()))?;
            info!(
                "stage {}: finished in {:.1}s",
                stage.name(),
                begun.elapsed().as_secs_f64()
            );
        }
        Ok(())
    }

    fn run_stage(&self, stage: Stage) -> Result<()> {
        match stage {
            Stage::PrepTargets => {
                pipeline::targets::prep_targets(&self.config, &self.targets_path())?;
            }
            Stage::PrepReads => {
                pipeline::reads::prep_reads(&self.config, &self.reads_path())?;
            }
            Stage::SortReads => {
                pipeline::dedup::dedup_reads(
                    &self.reads_path(),
                    &self.reads_sorted_path(),
                    &self.work_dir,
                )?;
            }
            Stage::WindowReads => {
                pipeline::windows::window_reads(&self.config, &self.reads_sorted_path(), |k| {
                    self.win_path(k)
                })?;
            }
            Stage::SortWindows => {
                for k in 0..self.config.windows.len() {
                    pipeline::sort_gz_file(
                        &self.win_path(k),
                        &self.win_sorted_path(k),
                        &self.work_dir,
                        Some(0),
                        false,
                    )?;
                }
            }
            Stage::Bloom => {
                let scan = pipeline::scan::build_filters(&self.config, &self.reads_sorted_path())?;
                scan.scan(&self.targets_path(), |k| self.bmatch_path(k))?;
            }
            Stage::SortBloom => {
                for k in 0..self.config.windows.len() {
                    pipeline::sort_gz_file(
                        &self.bmatch_path(k),
                        &self.smatch_path(k),
                        &self.work_dir,
                        Some(0),
                        false,
                    )?;
                }
            }
            Stage::MergeBloom => self.merge_bloom()?,
            Stage::CombineWindows => {
                let rmatch: Vec<PathBuf> = (0..self.config.windows.len())
                    .map(|k| self.rmatch_path(k))
                    .collect();
                pipeline::combine::combine_windows(&rmatch, &self.matches_path(), &self.work_dir)?;
                pipeline::combine::best_filter(
                    &self.config,
                    &self.matches_path(),
                    &self.matches_best_path(),
                )?;
            }
            Stage::JoinGeneNames => {
                pipeline::combine::join_gene_names(
                    &self.matches_best_path(),
                    &self.config.gene_id_file,
                    &self.matches_sg_path(),
                    &self.work_dir,
                )?;
            }
            Stage::JoinReadNames => {
                pipeline::combine::join_read_names(
                    &self.matches_sg_path(),
                    &self.reads_sorted_path(),
                    &self.matches_sn_path(),
                    &self.final_output_path(),
                    &self.work_dir,
                )?;
            }
        }
        Ok(())
    }

    /// Verify every window, at most `max_merge_procs` at a time.
    fn merge_bloom(&self) -> Result<()> {
        let windows: Vec<usize> = (0..self.config.windows.len()).collect();
        for chunk in windows.chunks(self.config.max_merge_procs) {
            let results = std::thread::scope(|s| {
                let handles: Vec<_> = chunk
                    .iter()
                    .map(|&k| {
                        s.spawn(move || {
                            pipeline::verify::merge_window(
                                &self.config,
                                k,
                                &self.win_sorted_path(k),
                                &self.smatch_path(k),
                                &self.rmatch_path(k),
                            )
                        })
                    })
                    .collect();
                handles
                    .into_iter()
                    .map(|h| h.join().map_err(|_| anyhow::anyhow!("verifier thread panicked")))
                    .collect::<Vec<_>>()
            });
            for result in results {
                result??;
            }
        }
        Ok(())
    }
}
