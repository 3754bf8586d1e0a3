pub mod badconf;
pub mod buckets;
pub mod count;
pub mod sniff;

use std::sync::Arc;

use ucollect_plugin::PluginRegistry;

/// Register the example plugins proving the hosting contract. A real
/// deployment replaces these with the actual measurement plugins named in
/// its config's per-plugin sections (§6) — this crate exists only to show
/// what a `Plugin` implementation looks like end to end, matching
/// `ando-plugins::register_all`'s role for the teacher's HTTP plugins.
pub fn register_all(registry: &mut PluginRegistry) {
    registry.register(count::CountPlugin::new());
    registry.register(Arc::new(sniff::SniffPlugin));
    registry.register(Arc::new(buckets::BucketsPlugin::default()));
    registry.register(Arc::new(badconf::BadconfPlugin));
}
