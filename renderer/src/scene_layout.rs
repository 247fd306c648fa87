use std::ops::Range;

/// Miss record traced by camera and bounce rays.
pub const PRIMARY_MISS_INDEX: u32 = 0;
/// Miss record traced by shadow rays.
pub const VISIBILITY_MISS_INDEX: u32 = 1;
pub const MISS_RECORD_COUNT: usize = 2;

/// Effective shader of one hit-group record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HitGroupSlot {
    /// Shading of geometry `i`; carries that geometry's local arguments.
    Geometry(usize),
    /// Procedural sphere light.
    Light,
    /// Shadow ray hit on geometry `i`.
    Visibility(usize),
}

/// Hit-group numbering shared by the acceleration structure builder and the shader table
/// builder. Geometry `i` is the `i`-th geometry of the mesh bottom-level structure and
/// owns record `i`; the light record follows, then one visibility record per geometry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SceneLayout {
    geometry_count: usize,
    light_count: usize,
}

impl SceneLayout {
    pub fn new(geometry_count: usize, light_count: usize) -> Self {
        Self {
            geometry_count,
            light_count,
        }
    }

    pub fn geometry_count(&self) -> usize {
        self.geometry_count
    }

    pub fn light_count(&self) -> usize {
        self.light_count
    }

    /// Geometry order of the mesh bottom-level structure.
    pub fn geometries(&self) -> Range<usize> {
        0..self.geometry_count
    }

    pub fn hit_group_index(&self, geometry: usize) -> u32 {
        debug_assert!(geometry < self.geometry_count);
        geometry as u32
    }

    pub fn light_hit_group_index(&self) -> u32 {
        self.geometry_count as u32
    }

    /// Record offset shadow rays add to reach the visibility records.
    pub fn visibility_hit_group_base(&self) -> u32 {
        self.geometry_count as u32 + 1
    }

    pub fn visibility_hit_group_index(&self, geometry: usize) -> u32 {
        debug_assert!(geometry < self.geometry_count);
        self.visibility_hit_group_base() + geometry as u32
    }

    /// Hit-group base of the mesh instance in the top-level structure.
    pub fn instance_hit_group_base(&self) -> u32 {
        0
    }

    /// Hit-group base a light instance would use.
    pub fn light_instance_hit_group_base(&self) -> u32 {
        self.light_hit_group_index()
    }

    pub fn hit_group_record_count(&self) -> usize {
        2 * self.geometry_count + 1
    }

    /// Every hit-group record in table order.
    pub fn slots(&self) -> impl Iterator<Item = HitGroupSlot> {
        let n = self.geometry_count;
        (0..n)
            .map(HitGroupSlot::Geometry)
            .chain(std::iter::once(HitGroupSlot::Light))
            .chain((0..n).map(HitGroupSlot::Visibility))
    }

    /// Record index of `slot`.
    pub fn index_of(&self, slot: HitGroupSlot) -> u32 {
        match slot {
            HitGroupSlot::Geometry(i) => self.hit_group_index(i),
            HitGroupSlot::Light => self.light_hit_group_index(),
            HitGroupSlot::Visibility(i) => self.visibility_hit_group_index(i),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_count_is_geometries_plus_light_plus_visibility() {
        for n in 0..5 {
            let layout = SceneLayout::new(n, 3);
            assert_eq!(layout.hit_group_record_count(), n + 1 + n);
            assert_eq!(layout.slots().count(), layout.hit_group_record_count());
        }
    }

    #[test]
    fn slots_are_numbered_in_table_order() {
        let layout = SceneLayout::new(3, 0);
        for (position, slot) in layout.slots().enumerate() {
            assert_eq!(layout.index_of(slot) as usize, position);
        }
        assert_eq!(layout.light_hit_group_index(), 3);
        assert_eq!(layout.visibility_hit_group_base(), 4);
        assert_eq!(layout.visibility_hit_group_index(2), 6);
    }

    #[test]
    fn single_geometry_without_lights() {
        let layout = SceneLayout::new(1, 0);
        let slots: Vec<_> = layout.slots().collect();
        assert_eq!(
            slots,
            vec![
                HitGroupSlot::Geometry(0),
                HitGroupSlot::Light,
                HitGroupSlot::Visibility(0)
            ]
        );
        assert_eq!(layout.instance_hit_group_base(), 0);
        assert_eq!(layout.light_instance_hit_group_base(), 1);
    }

    #[test]
    fn geometry_order_matches_hit_group_order() {
        let layout = SceneLayout::new(4, 1);
        let order: Vec<u32> = layout
            .geometries()
            .map(|g| layout.instance_hit_group_base() + layout.hit_group_index(g))
            .collect();
        assert_eq!(order, vec![0, 1, 2, 3]);
    }
}
