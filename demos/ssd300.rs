//! Computes the prior boxes of the SSD300 network and prints a summary of every level.

use ssd_priors::detection::ssd::{AnchorParams, Anchors};

fn main() -> anyhow::Result<()> {
    ssd_priors::init_logger!();

    let params = AnchorParams::ssd300();
    let anchors = Anchors::calculate(&params)?;

    let mut offset = 0;
    for (level, &fmap) in params.feature_maps.iter().enumerate() {
        let count = (fmap * fmap) as usize * params.boxes_per_cell(level);
        let first = &anchors[offset];
        log::info!(
            "level {}: {}x{}, anchors {}..{}, first box {:?}",
            level,
            fmap,
            fmap,
            offset,
            offset + count,
            first.to_array(),
        );
        offset += count;
    }

    let table = anchors.to_array();
    println!("{} anchors, table shape {:?}", anchors.anchor_count(), table.dim());
    for row in table.rows().into_iter().take(8) {
        println!("{:.5} {:.5} {:.5} {:.5}", row[0], row[1], row[2], row[3]);
    }

    Ok(())
}
