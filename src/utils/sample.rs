// src/utils/sample.rs: samples, features and the sample db parser
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use lazy_static::lazy_static;
use log::{debug, info};
use regex::Regex;

use crate::config::defs::{PipelineError, Strand, NO_BC_NAME};

lazy_static! {
    static ref EXPERIMENT_RE: Regex = Regex::new(r"^.*experiment.*:\s+(\w+)").unwrap();
    static ref FEATURE_RE: Regex = Regex::new(
        r"^\s*(?P<name>\w+)\s*(?:\((?P<short_name>\w+)\))?\s*:(?P<type>\w+)(?:\[(?P<units>\w+)\])?\s*$"
    )
    .unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureType {
    Str,
    Int,
    Float,
}

impl FeatureType {
    fn parse(s: &str) -> Option<FeatureType> {
        match s {
            "str" => Some(FeatureType::Str),
            "int" => Some(FeatureType::Int),
            "float" => Some(FeatureType::Float),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FeatureType::Str => "str",
            FeatureType::Int => "int",
            FeatureType::Float => "float",
        }
    }

    fn cast(&self, raw: &str) -> Option<FeatureValue> {
        match self {
            FeatureType::Str => Some(FeatureValue::Str(raw.to_string())),
            FeatureType::Int => raw.parse().ok().map(FeatureValue::Int),
            FeatureType::Float => raw.parse().ok().map(FeatureValue::Float),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeatureValue {
    Str(String),
    Int(i64),
    Float(f64),
}

impl fmt::Display for FeatureValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeatureValue::Str(s) => write!(f, "{}", s),
            FeatureValue::Int(i) => write!(f, "{}", i),
            FeatureValue::Float(x) => write!(f, "{}", x),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    pub name: String,
    pub short_name: String,
    pub kind: FeatureType,
    pub units: Option<String>,
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({}):{}", self.name, self.short_name, self.kind.as_str())?;
        if let Some(units) = &self.units {
            write!(f, "[{}]", units)?;
        }
        Ok(())
    }
}

impl Feature {
    /// Parses `<name>[(<short_name>)]:<type>[[<units>]]`.
    pub fn from_spec(spec: &str) -> Option<Feature> {
        let caps = FEATURE_RE.captures(spec)?;
        let name = caps.name("name")?.as_str().to_string();
        let kind = FeatureType::parse(caps.name("type")?.as_str())?;
        let short_name = caps
            .name("short_name")
            .map(|m| m.as_str().to_string())
            .unwrap_or_else(|| name.clone());
        let units = caps.name("units").map(|m| m.as_str().to_string());
        Some(Feature { name, short_name, kind, units })
    }
}

/// Features shared by every sample of a run. Names and short names are unique.
#[derive(Debug, Clone, Default)]
pub struct FeatureCollection {
    features: Vec<Feature>,
}

impl FeatureCollection {
    pub fn add_feature(&mut self, feature: Feature) -> Result<(), String> {
        let clash = self.features.iter().find(|f| {
            [&f.name, &f.short_name]
                .iter()
                .any(|taken| **taken == feature.name || **taken == feature.short_name)
        });
        if let Some(existing) = clash {
            return Err(format!(
                "features must have distinct names and short names - '{}' clashes with '{}'",
                feature, existing
            ));
        }
        self.features.push(feature);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Feature> {
        self.features.iter()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub barcode: String,
    /// Feature values, in feature-collection order.
    pub values: Vec<(String, FeatureValue)>,
    /// Logical file name -> path, filled in once the output layout is known.
    pub files: HashMap<String, PathBuf>,
}

impl Sample {
    pub fn new(barcode: &str) -> Self {
        Sample { barcode: barcode.to_string(), values: Vec::new(), files: HashMap::new() }
    }

    /// Name used for files, channels and statistics rows.
    pub fn base_name(&self) -> String {
        if self.values.is_empty() {
            return self.barcode.clone();
        }
        self.values.iter().map(|(_, v)| v.to_string()).collect::<Vec<_>>().join("_")
    }

    pub fn file(&self, key: &str) -> anyhow::Result<&PathBuf> {
        self.files
            .get(key)
            .ok_or_else(|| anyhow::anyhow!("sample {} has no '{}' file assigned", self.base_name(), key))
    }

    pub fn track_key(strand: Strand) -> String {
        format!("bw_{}", strand.tag())
    }

    pub fn tmp_bed_key(strand: Strand) -> String {
        format!("tmp_bed_{}", strand.tag())
    }

    fn value_key(&self) -> Vec<String> {
        self.values.iter().map(|(_, v)| v.to_string()).collect()
    }
}

impl fmt::Display for Sample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.base_name())
    }
}

/// Everything read from a sample db file. Samples keep file order.
#[derive(Debug, Clone)]
pub struct SampleRegistry {
    pub experiment: String,
    pub barcode_len: usize,
    pub features: FeatureCollection,
    pub samples: Vec<Sample>,
}

impl SampleRegistry {
    pub fn barcodes(&self) -> Vec<&str> {
        self.samples.iter().map(|s| s.barcode.as_str()).collect()
    }

    pub fn by_barcode(&self, barcode: &str) -> Option<&Sample> {
        self.samples.iter().find(|s| s.barcode == barcode)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

fn db_error(path: &Path, reason: impl Into<String>) -> PipelineError {
    PipelineError::InvalidSampleDb { path: path.display().to_string(), reason: reason.into() }
}

/// Reads a sample db file.
///
/// # Arguments
///
/// * `path` - sample db: an `experiment: <name>` line, a `barcode,<feature specs>` header,
///   then one sample per line. Lines starting with '#' are comments.
/// * `max_samples` - keep only this many samples (debug runs).
///
/// # Returns
/// SampleRegistry, or an InvalidSampleDb error naming the first problem found.
pub fn parse_sample_db(path: &Path, max_samples: Option<usize>) -> Result<SampleRegistry, PipelineError> {
    let text = fs::read_to_string(path).map_err(|e| db_error(path, format!("cannot read file: {}", e)))?;
    parse_sample_db_str(&text, path, max_samples)
}

pub fn parse_sample_db_str(text: &str, path: &Path, max_samples: Option<usize>) -> Result<SampleRegistry, PipelineError> {
    let mut lines = text.lines();

    let experiment = lines
        .next()
        .and_then(|l| EXPERIMENT_RE.captures(l))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| db_error(path, "first line should name the experiment: 'experiment: <expname>'"))?;

    let header = lines.next().ok_or_else(|| db_error(path, "missing header line"))?;
    let delim = if header.contains('\t') { '\t' } else { ',' };
    let (features, columns) = parse_header(header, delim, path)?;

    let mut samples: Vec<Sample> = Vec::new();
    let mut seen_barcodes = HashSet::new();
    let mut seen_values = HashSet::new();
    let mut seen_names: HashMap<String, String> = HashMap::new();
    let mut barcode_len = None;

    for (lineno, line) in lines.enumerate().map(|(i, l)| (i + 3, l)) {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if max_samples.is_some_and(|max| samples.len() >= max) {
            break;
        }

        let mut fields = trimmed.split(delim).map(str::trim);
        let barcode = fields.next().unwrap_or_default().to_ascii_uppercase();
        let expected = *barcode_len.get_or_insert(barcode.len());
        if barcode.is_empty() || barcode.len() != expected {
            return Err(db_error(path, format!("line {}: barcode '{}' has a different length (expected {})", lineno, barcode, expected)));
        }
        if !seen_barcodes.insert(barcode.clone()) {
            return Err(db_error(path, format!("line {}: barcode {} is not unique", lineno, barcode)));
        }

        let mut sample = Sample::new(&barcode);
        for (col, raw) in fields.enumerate().map(|(i, v)| (i + 1, v)) {
            let Some(feature) = columns.get(&col) else { continue };
            let value = feature.kind.cast(raw).ok_or_else(|| {
                db_error(
                    path,
                    format!("line {}: couldn't cast '{}' of feature '{}' to {}", lineno, raw, feature.name, feature.kind.as_str()),
                )
            })?;
            sample.values.push((feature.name.clone(), value));
        }
        if sample.values.len() != columns.len() {
            return Err(db_error(path, format!("line {}: expected {} feature values, found {}", lineno, columns.len(), sample.values.len())));
        }
        if !seen_values.insert(sample.value_key()) {
            return Err(db_error(path, format!("line {}: 2 samples (or more) seem to be identical - {}", lineno, sample)));
        }
        let name = sample.base_name();
        if name == NO_BC_NAME {
            return Err(db_error(path, format!("line {}: sample name '{}' is reserved", lineno, name)));
        }
        if let Some(other) = seen_names.insert(name.clone(), barcode.clone()) {
            return Err(db_error(
                path,
                format!("line {}: samples {} and {} would both be named '{}'", lineno, other, barcode, name),
            ));
        }
        samples.push(sample);
    }

    if samples.is_empty() {
        return Err(db_error(path, "no samples defined"));
    }

    info!("experiment: {}, found {} samples.", experiment, samples.len());
    debug!(
        "barcodes:\n{}",
        samples.iter().map(|s| format!("{} -> {}", s.barcode, s.base_name())).collect::<Vec<_>>().join("\n")
    );

    Ok(SampleRegistry { experiment, barcode_len: barcode_len.unwrap_or(0), features, samples })
}

/// Column index -> feature for every non-ignored column after `barcode`.
fn parse_header(header: &str, delim: char, path: &Path) -> Result<(FeatureCollection, HashMap<usize, Feature>), PipelineError> {
    let mut features = FeatureCollection::default();
    let mut columns = HashMap::new();
    for (i, col) in header.split(delim).map(str::trim).enumerate() {
        if i == 0 {
            if col != "barcode" {
                return Err(db_error(path, "first column in sample db needs to be the \"barcode\" column"));
            }
            continue;
        }
        if col.starts_with('#') {
            info!("ignoring column {} in sample db", col);
            continue;
        }
        let feature = Feature::from_spec(col).ok_or_else(|| {
            db_error(
                path,
                format!(
                    "couldn't understand feature '{}', format should be <name>(<short_name>):(str|int|float)[units] \
                     (short_name and units are optional), or start the column with '#' to ignore it",
                    col
                ),
            )
        })?;
        features.add_feature(feature.clone()).map_err(|e| db_error(path, e))?;
        columns.insert(i, feature);
    }
    Ok((features, columns))
}
