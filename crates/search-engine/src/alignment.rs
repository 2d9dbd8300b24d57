use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Rigid superposition of a candidate onto the query.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AlignmentMatrix {
    /// Row-major 3x3 rotation.
    pub rotation: [[f64; 3]; 3],
    /// Translation applied after rotation.
    pub translation: [f64; 3],
}

impl AlignmentMatrix {
    /// No rotation, no translation.
    pub const IDENTITY: AlignmentMatrix = AlignmentMatrix {
        rotation: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
        translation: [0.0, 0.0, 0.0],
    };

    /// Build from a flat row-major 3x4 (12 values) or homogeneous 4x4 (16 values) matrix.
    pub fn from_flat(values: &[f64]) -> anyhow::Result<Self> {
        if values.len() != 12 && values.len() != 16 {
            anyhow::bail!(
                "alignment matrix needs 12 or 16 values, got {}",
                values.len()
            );
        }
        let mut rotation = [[0.0; 3]; 3];
        let mut translation = [0.0; 3];
        for row in 0..3 {
            for col in 0..3 {
                rotation[row][col] = values[row * 4 + col];
            }
            translation[row] = values[row * 4 + 3];
        }
        Ok(Self {
            rotation,
            translation,
        })
    }

    /// Flat row-major 3x4 form.
    pub fn to_flat(&self) -> [f64; 12] {
        let mut out = [0.0; 12];
        for row in 0..3 {
            for col in 0..3 {
                out[row * 4 + col] = self.rotation[row][col];
            }
            out[row * 4 + 3] = self.translation[row];
        }
        out
    }

    /// `;`-separated text form stored in the result cache.
    pub fn to_cache_string(&self) -> String {
        self.to_flat()
            .iter()
            .map(|x| format!("{x:.3}"))
            .collect::<Vec<_>>()
            .join(";")
    }

    /// Parse the cache text form.
    pub fn parse_cache_string(raw: &str) -> anyhow::Result<Self> {
        let values = raw
            .split(';')
            .map(|part| {
                part.trim()
                    .parse::<f64>()
                    .with_context(|| format!("invalid matrix value {part:?}"))
            })
            .collect::<anyhow::Result<Vec<f64>>>()?;
        Self::from_flat(&values)
    }
}

/// Output of the structural alignment routine.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Alignment {
    /// Q-score.
    pub qscore: f64,
    /// RMSD of the superposition.
    pub rmsd: f64,
    /// Sequence identity.
    pub seq_identity: f64,
    /// Aligned residues.
    pub aligned_length: u32,
    /// Superposition of the candidate onto the query.
    pub matrix: AlignmentMatrix,
}

/// The expensive pairwise structural comparison. Called from blocking threads.
pub trait Aligner: Send + Sync {
    /// Compare `query` with `other`; `min_qscore` lets the routine bail out early
    /// on hopeless pairs.
    fn align(&self, query: &str, other: &str, min_qscore: f64) -> anyhow::Result<Alignment>;
}

/// Inputs of one comparison rendering.
#[derive(Debug, Clone)]
pub struct RenderRequest<'a> {
    /// Job working directory; images land here.
    pub job_dir: &'a Path,
    /// Query chain identifier.
    pub query: &'a str,
    /// Query label drawn on the image.
    pub query_name: &'a str,
    /// Candidate chain identifier.
    pub other: &'a str,
    /// Superposition of the candidate onto the query.
    pub matrix: &'a AlignmentMatrix,
}

/// Best-effort renderer of aligned structure pairs. Called from blocking threads.
pub trait Visualizer: Send + Sync {
    /// Render one comparison image.
    fn render(&self, request: &RenderRequest<'_>) -> anyhow::Result<()>;
}

#[derive(Debug, Deserialize)]
struct AlignerOutput {
    qscore: f64,
    rmsd: f64,
    seq_identity: f64,
    aligned: i64,
    transform: Vec<f64>,
}

/// [`Aligner`] backed by an external executable.
///
/// Invoked as `<program> <archive_dir> <query> <other> <min_qscore>`; stdout must
/// hold one JSON object with `qscore`, `rmsd`, `seq_identity`, `aligned` and a
/// flat `transform`.
#[derive(Debug, Clone)]
pub struct ExternalAligner {
    program: PathBuf,
    archive_dir: PathBuf,
}

impl ExternalAligner {
    /// Aligner running `program` against chains stored under `archive_dir`.
    pub fn new(program: impl Into<PathBuf>, archive_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            archive_dir: archive_dir.into(),
        }
    }
}

impl Aligner for ExternalAligner {
    fn align(&self, query: &str, other: &str, min_qscore: f64) -> anyhow::Result<Alignment> {
        let output = Command::new(&self.program)
            .arg(&self.archive_dir)
            .arg(query)
            .arg(other)
            .arg(min_qscore.to_string())
            .output()
            .with_context(|| format!("spawn aligner {}", self.program.display()))?;
        if !output.status.success() {
            anyhow::bail!(
                "aligner exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        parse_aligner_output(&output.stdout)
    }
}

fn parse_aligner_output(stdout: &[u8]) -> anyhow::Result<Alignment> {
    let raw: AlignerOutput = serde_json::from_slice(stdout).context("parse aligner output")?;
    Ok(Alignment {
        qscore: raw.qscore,
        rmsd: raw.rmsd,
        seq_identity: raw.seq_identity,
        aligned_length: u32::try_from(raw.aligned.max(0)).unwrap_or(u32::MAX),
        matrix: AlignmentMatrix::from_flat(&raw.transform)?,
    })
}

/// [`Visualizer`] drawing with PyMOL and labelling with ImageMagick `convert`.
#[derive(Debug, Clone)]
pub struct CommandVisualizer {
    /// PyMOL executable.
    pub pymol: PathBuf,
    /// ImageMagick `convert` executable.
    pub convert: PathBuf,
    /// PyMOL script drawing the two structures.
    pub draw_script: PathBuf,
    /// Raw structure files, looked up as `<raw_pdbs>/<entry>.cif`.
    pub raw_pdbs: PathBuf,
}

impl CommandVisualizer {
    fn structure_path(&self, chain_id: &str) -> PathBuf {
        let entry = chain_id.split(':').next().unwrap_or(chain_id);
        self.raw_pdbs.join(format!("{}.cif", entry.to_lowercase()))
    }
}

impl Visualizer for CommandVisualizer {
    fn render(&self, request: &RenderRequest<'_>) -> anyhow::Result<()> {
        std::fs::create_dir_all(request.job_dir)
            .with_context(|| format!("create {}", request.job_dir.display()))?;

        let matrix_path = request.job_dir.join(format!("{}.matrix", request.other));
        std::fs::write(&matrix_path, request.matrix.to_cache_string())?;
        let output_png = request.job_dir.join(format!("{}.aligned.png", request.other));

        let status = Command::new(&self.pymol)
            .arg("-qrc")
            .arg(&self.draw_script)
            .arg("--")
            .arg(self.structure_path(request.query))
            .arg(self.structure_path(request.other))
            .arg(&matrix_path)
            .arg(&output_png)
            .status()
            .context("spawn pymol")?;
        if !status.success() {
            anyhow::bail!("pymol exited with {status}");
        }

        let status = Command::new(&self.convert)
            .args(["-fill", "rgb(33, 155, 119)", "-font", "Carlito-Bold", "-pointsize", "24"])
            .arg("-draw")
            .arg(format!("text 20, 40 \"{} (query)\"", request.query_name))
            .args(["-fill", "rgb(192, 85, 25)"])
            .arg("-draw")
            .arg(format!("text 20, 70 \"{}\"", request.other))
            .arg(&output_png)
            .arg(&output_png)
            .status()
            .context("spawn convert")?;
        if !status.success() {
            anyhow::bail!("convert exited with {status}");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_string_accepts_homogeneous_matrix() {
        let raw = "1;0;0;0;0;1;0;0;0;0;1;0;0;0;0;1";
        let m = AlignmentMatrix::parse_cache_string(raw).unwrap();
        assert_eq!(m, AlignmentMatrix::IDENTITY);
    }

    #[test]
    fn cache_string_keeps_three_decimals() {
        let mut m = AlignmentMatrix::IDENTITY;
        m.translation = [1.23456, -2.0, 0.5];
        let text = m.to_cache_string();
        assert_eq!(
            text,
            "1.000;0.000;0.000;1.235;0.000;1.000;0.000;-2.000;0.000;0.000;1.000;0.500"
        );
        let parsed = AlignmentMatrix::parse_cache_string(&text).unwrap();
        assert_eq!(parsed.translation, [1.235, -2.0, 0.5]);
    }

    #[test]
    fn cache_string_rejects_wrong_length() {
        assert!(AlignmentMatrix::parse_cache_string("1;2;3").is_err());
        assert!(AlignmentMatrix::parse_cache_string("1;x;3").is_err());
    }

    #[test]
    fn aligner_output_is_parsed() {
        let stdout = br#"{"qscore":0.81,"rmsd":1.2,"seq_identity":0.4,"aligned":120,
            "transform":[1,0,0,5,0,1,0,6,0,0,1,7]}"#;
        let alignment = parse_aligner_output(stdout).unwrap();
        assert_eq!(alignment.aligned_length, 120);
        assert_eq!(alignment.matrix.translation, [5.0, 6.0, 7.0]);
    }

    #[test]
    fn negative_aligned_count_clamps_to_zero() {
        let stdout = br#"{"qscore":0.0,"rmsd":0.0,"seq_identity":0.0,"aligned":-1,
            "transform":[1,0,0,0,0,1,0,0,0,0,1,0]}"#;
        assert_eq!(parse_aligner_output(stdout).unwrap().aligned_length, 0);
    }
}
