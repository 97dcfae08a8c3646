use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    thread,
};

use approx::{assert_abs_diff_eq, assert_relative_eq};
use ssd_priors::detection::ssd::{generate, AnchorParams, Anchors, ConfigError};

fn rng() -> fastrand::Rng {
    let mut hasher = DefaultHasher::new();
    thread::current().name().unwrap().hash(&mut hasher);
    fastrand::Rng::with_seed(hasher.finish())
}

fn random_params(rng: &mut fastrand::Rng) -> AnchorParams {
    let levels = rng.usize(1..=6);
    let image_size = f64::from(rng.u32(64..=640));
    let mut params = AnchorParams {
        image_size,
        feature_maps: Vec::new(),
        strides: Vec::new(),
        min_sizes: Vec::new(),
        max_sizes: Vec::new(),
        aspect_ratios: Vec::new(),
        clip: rng.bool(),
    };
    for _ in 0..levels {
        let fmap = rng.u32(0..=20);
        let min_size = rng.f64() * image_size;
        params.feature_maps.push(fmap);
        params.strides.push(image_size / f64::from(fmap.max(1)));
        params.min_sizes.push(min_size);
        params.max_sizes.push(min_size + rng.f64() * image_size);
        let ratio_count = rng.usize(0..=3);
        params
            .aspect_ratios
            .push((0..ratio_count).map(|_| 1.0 + rng.f64() * 3.0).collect());
    }
    params
}

#[test]
fn ssd300_count() {
    let params = AnchorParams::default();
    assert_eq!(params, AnchorParams::ssd300());
    assert_eq!(params.anchor_count(), 8732);

    let anchors = Anchors::calculate(&params).unwrap();
    assert_eq!(anchors.anchor_count(), 8732);
    assert_eq!(anchors.to_array().dim(), (8732, 4));
}

#[test]
fn ssd300_layout() {
    let params = AnchorParams::ssd300();
    let anchors = Anchors::calculate(&params).unwrap();

    // first box of the 38x38 level
    let first = anchors[0];
    assert_relative_eq!(first.x_center(), 0.5 * 8.0 / 300.0);
    assert_relative_eq!(first.y_center(), 0.5 * 8.0 / 300.0);
    assert_relative_eq!(first.width(), 21.0 / 300.0);

    // second cell of the first row starts after 4 boxes
    assert_relative_eq!(anchors[4].x_center(), 1.5 * 8.0 / 300.0);
    assert_relative_eq!(anchors[4].y_center(), 0.5 * 8.0 / 300.0);
    // the second row starts after 38 cells
    assert_relative_eq!(anchors[38 * 4].x_center(), 0.5 * 8.0 / 300.0);
    assert_relative_eq!(anchors[38 * 4].y_center(), 1.5 * 8.0 / 300.0);

    // the 1x1 level is last and centered
    let last = &anchors.as_slice()[8732 - 4..];
    for anchor in last {
        assert_eq!(anchor.x_center(), 0.5);
        assert_eq!(anchor.y_center(), 0.5);
    }
    assert_relative_eq!(last[1].width(), (261.0f32 * 315.0).sqrt() / 300.0);
    // 0.87 * sqrt(2) exceeds 1 and is clipped
    assert_eq!(last[2].width(), 1.0);
}

#[test]
fn ssd300_unclipped() {
    let clipped = Anchors::calculate(&AnchorParams::ssd300()).unwrap();
    let unclipped = Anchors::calculate(&AnchorParams::ssd300().with_clip(false)).unwrap();
    assert_eq!(clipped.anchor_count(), unclipped.anchor_count());

    let last = unclipped.as_slice().last().unwrap();
    assert_relative_eq!(last.height(), 261.0 / 300.0 * 2.0f32.sqrt(), epsilon = 1e-6);
    assert!(last.height() > 1.0);

    for (c, u) in clipped.iter().zip(&unclipped) {
        for (c, u) in c.to_array().into_iter().zip(u.to_array()) {
            assert_eq!(c, u.clamp(0.0, 1.0));
        }
    }
}

#[test]
fn deterministic() {
    let params = AnchorParams::ssd300();
    let a = Anchors::calculate(&params).unwrap();
    let b = generate(&params).unwrap();
    assert_eq!(a, b);
}

#[test]
fn invalid_sizes() {
    let params = AnchorParams {
        image_size: 300.0,
        feature_maps: vec![1],
        strides: vec![300.0],
        min_sizes: vec![50.0],
        max_sizes: vec![10.0],
        aspect_ratios: vec![vec![2.0]],
        clip: true,
    };
    assert!(matches!(
        generate(&params),
        Err(ConfigError::InvalidSizes { level: 0, .. })
    ));
}

#[test]
fn random_configs() {
    let mut rng = rng();
    for _ in 0..50 {
        let params = random_params(&mut rng);
        let anchors = Anchors::calculate(&params).unwrap();

        let expected = params
            .feature_maps
            .iter()
            .zip(&params.aspect_ratios)
            .map(|(&f, r)| (f * f) as usize * (2 + 2 * r.len()))
            .sum::<usize>();
        assert_eq!(anchors.anchor_count(), expected);
        assert_eq!(params.anchor_count(), expected);

        for anchor in &anchors {
            assert!(anchor.width() >= 0.0 && anchor.height() >= 0.0);
            if params.clip {
                for v in anchor.to_array() {
                    assert!((0.0..=1.0).contains(&v), "{v} out of range in {params:?}");
                }
            }
        }

        // every cell's boxes share their center
        let mut offset = 0;
        for (level, &fmap) in params.feature_maps.iter().enumerate() {
            let per_cell = params.boxes_per_cell(level);
            for cell in anchors.as_slice()[offset..][..(fmap * fmap) as usize * per_cell]
                .chunks(per_cell)
            {
                for anchor in cell {
                    assert_abs_diff_eq!(anchor.x_center(), cell[0].x_center());
                    assert_abs_diff_eq!(anchor.y_center(), cell[0].y_center());
                }
            }
            offset += (fmap * fmap) as usize * per_cell;
        }
    }
}
