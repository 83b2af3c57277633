//!Raft layer bookkeeping: how many layers exist below the model and what
//!each negative layer index is made of.

use crate::geometry::Coord;
use crate::settings::Settings;

///What a layer below the model consists of.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RaftLayerType {
    RaftBase,
    RaftInterface,
    RaftSurface,
    ///A filler layer inside the air gap between raft and model.
    Airgap,
    Model,
}

///Height difference between the raft top and the bottom of layer 0, µm.
pub fn z_diff_between_raft_and_layer_0(settings: &Settings) -> Coord {
    if !settings.raft_enabled {
        return 0;
    }
    (settings.raft_airgap - settings.layer_0_z_overlap).max(0)
}

///Number of filler layers occupying the air gap.
pub fn filler_layer_count(settings: &Settings) -> usize {
    let diff = z_diff_between_raft_and_layer_0(settings);
    if diff == 0 {
        return 0;
    }
    ((diff + settings.layer_height - 1) / settings.layer_height) as usize
}

///Height of each filler layer, µm.
pub fn filler_layer_height(settings: &Settings) -> Coord {
    let count = filler_layer_count(settings);
    if count == 0 {
        return settings.layer_height;
    }
    z_diff_between_raft_and_layer_0(settings) / count as Coord
}

///Total raft thickness without the air gap, µm.
pub fn total_thickness(settings: &Settings) -> Coord {
    if !settings.raft_enabled {
        return 0;
    }
    settings.raft_base_thickness
        + settings.raft_interface_layers as Coord * settings.raft_interface_thickness
        + settings.raft_surface_layers as Coord * settings.raft_surface_thickness
}

///Number of layers below layer 0: the raft itself plus the filler layers.
pub fn total_extra_layers(settings: &Settings) -> usize {
    if !settings.raft_enabled {
        return 0;
    }
    1 + settings.raft_interface_layers + settings.raft_surface_layers + filler_layer_count(settings)
}

///Classify a (possibly negative) layer index.
pub fn layer_type(settings: &Settings, layer_nr: i64) -> RaftLayerType {
    if layer_nr >= 0 || !settings.raft_enabled {
        return RaftLayerType::Model;
    }
    let extra = total_extra_layers(settings) as i64;
    let index_from_bottom = layer_nr + extra;
    if index_from_bottom < 0 {
        return RaftLayerType::Model;
    }
    let interface = settings.raft_interface_layers as i64;
    let surface = settings.raft_surface_layers as i64;
    if index_from_bottom == 0 {
        RaftLayerType::RaftBase
    } else if index_from_bottom <= interface {
        RaftLayerType::RaftInterface
    } else if index_from_bottom <= interface + surface {
        RaftLayerType::RaftSurface
    } else {
        RaftLayerType::Airgap
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raft_settings() -> Settings {
        let mut settings = Settings::default();
        settings.raft_enabled = true;
        settings
    }

    #[test]
    fn no_raft_means_no_extra_layers() {
        let settings = Settings::default();
        assert_eq!(total_extra_layers(&settings), 0);
        assert_eq!(layer_type(&settings, -1), RaftLayerType::Model);
    }

    #[test]
    fn raft_layers_classify_bottom_up() {
        let settings = raft_settings();
        let extra = total_extra_layers(&settings) as i64;
        assert_eq!(layer_type(&settings, -extra), RaftLayerType::RaftBase);
        assert_eq!(layer_type(&settings, -extra + 1), RaftLayerType::RaftInterface);
        assert_eq!(layer_type(&settings, -1), RaftLayerType::Airgap);
        assert_eq!(layer_type(&settings, 0), RaftLayerType::Model);
    }

    #[test]
    fn filler_layers_cover_the_airgap() {
        let settings = raft_settings();
        let count = filler_layer_count(&settings);
        assert!(count >= 1);
        assert!(filler_layer_height(&settings) * count as Coord <= settings.raft_airgap);
    }
}
