//! Segmentation layers built from configuration.

mod common;
use common::{write_labels, write_rgb};
use data_layers::{DataLayer, DataLayerConfig, DataLayerError, Phase, SourceKind};

use anyhow::{Context, Result};
use std::fs;
use tempfile::TempDir;

fn fixture(line: &str) -> Result<TempDir> {
    let dir = TempDir::new()?;
    write_rgb(&dir.path().join("img.png"), 6, 4, 90)?;
    write_labels(&dir.path().join("seg.png"), 6, 4, |x, _| if x < 3 { 0 } else { 7 })?;
    fs::write(dir.path().join("list.txt"), format!("{}\n", line))?;
    Ok(dir)
}

fn config(dir: &TempDir, variant: SourceKind) -> DataLayerConfig {
    DataLayerConfig::builder()
        .variant(variant)
        .source(dir.path().join("list.txt"))
        .root_folder(dir.path())
        .batch_size(2)
        .seed(4)
        .build()
}

#[test]
fn test_label_map_is_padded_with_ignore_label() -> Result<()> {
    let dir = fixture("img.png seg.png 0 0 5 3")?;
    let mut config = config(&dir, SourceKind::WindowSegBinary);
    config.transform.crop_size = 8;
    config.transform.phase = Phase::Test;
    let mut layer = DataLayer::setup(&config)?;
    assert_eq!(layer.output_names(), vec!["data", "label", "dim"]);

    let batch = layer.forward()?;
    assert_eq!(batch.data().size(), vec![2, 3, 8, 8]);
    let label = batch.get("label").context("label")?;
    assert_eq!(label.size(), vec![2, 1, 8, 8]);

    // Image occupies the top-left 4x6 block, the rest is padding.
    assert_eq!(batch.data().double_value(&[0, 0, 0, 0]), 90.0);
    assert_eq!(batch.data().double_value(&[0, 0, 7, 7]), 0.0);
    assert_eq!(label.double_value(&[0, 0, 0, 0]), 0.0);
    assert_eq!(label.double_value(&[0, 0, 0, 5]), 1.0);
    assert_eq!(label.double_value(&[0, 0, 6, 2]), 255.0);

    let dim = batch.get("dim").context("dim")?;
    assert_eq!(dim.size(), vec![2, 2]);
    assert_eq!(dim.double_value(&[1, 0]), 4.0);
    assert_eq!(dim.double_value(&[1, 1]), 6.0);
    Ok(())
}

#[test]
fn test_mirror_moves_image_and_label_together() -> Result<()> {
    let dir = fixture("img.png seg.png")?;
    let mut config = config(&dir, SourceKind::ImageSeg);
    config.transform.mirror = true;
    config.batch_size = 16;
    let mut layer = DataLayer::setup(&config)?;

    let batch = layer.forward()?;
    let label = batch.get("label").context("label")?;
    let mut flipped = 0;
    for row in 0..16 {
        let left = label.double_value(&[row, 0, 0, 0]);
        let right = label.double_value(&[row, 0, 0, 5]);
        assert_ne!(left, right);
        if left == 7.0 {
            flipped += 1;
        }
    }
    assert!(flipped > 0 && flipped < 16, "mirror is random per record ({} of 16)", flipped);
    Ok(())
}

#[test]
fn test_auto_arity_allows_fewer_outputs() -> Result<()> {
    let dir = fixture("img.png seg.png 0 0 5 3 7")?;
    let mut config = config(&dir, SourceKind::SelectSegBinary);
    config.label_dim = 8;
    config.top_count = Some(1);
    let mut layer = DataLayer::setup(&config)?;

    let batch = layer.forward()?;
    assert_eq!(batch.names(), vec!["data"]);

    config.label_dim = 0;
    let err = DataLayer::setup(&config).err().context("label_dim is required")?;
    assert!(DataLayerError::is_config(&err));
    Ok(())
}
