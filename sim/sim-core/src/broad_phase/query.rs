//! Query shapes, layer filters and hit collectors for broad-phase queries.

use nalgebra::{Point3, Vector3};
use sim_types::{
    Aabb, AllLayers, BodyId, BroadPhaseLayer, BroadPhaseLayerFilter, CollisionLayer,
    CollisionLayerPairFilter, OrientedBox, PhysicsLockContext,
};

use super::quad_tree::TreeVisitor;
use super::{BodyTracker, BroadPhase};

/// A ray `origin + fraction * direction` with `fraction` in `[0, 1]`: the
/// direction carries the length of the ray.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RayCast {
    /// Start of the ray.
    pub origin: Point3<f64>,
    /// Direction scaled by the ray length.
    pub direction: Vector3<f64>,
}

impl RayCast {
    /// Create a ray.
    #[must_use]
    pub const fn new(origin: Point3<f64>, direction: Vector3<f64>) -> Self {
        Self { origin, direction }
    }

    /// Point at `fraction` along the ray.
    #[must_use]
    pub fn point_on_ray(&self, fraction: f64) -> Point3<f64> {
        self.origin + self.direction * fraction
    }

    pub(crate) fn hit_fraction(&self, bounds: &Aabb) -> Option<f64> {
        bounds
            .ray_entry_fraction(&self.origin, &self.direction)
            .filter(|&fraction| fraction <= 1.0)
    }
}

/// An axis-aligned box swept along `direction`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AaBoxCast {
    /// Box at the start of the sweep.
    pub aabb: Aabb,
    /// Sweep direction scaled by the sweep length.
    pub direction: Vector3<f64>,
}

impl AaBoxCast {
    /// Create a box sweep.
    #[must_use]
    pub const fn new(aabb: Aabb, direction: Vector3<f64>) -> Self {
        Self { aabb, direction }
    }

    /// Sweeping a box against a box is a ray cast from the box center against
    /// the other box grown by the half extents.
    pub(crate) fn hit_fraction(&self, bounds: &Aabb) -> Option<f64> {
        let half = self.aabb.half_extents();
        let grown = Aabb::new(bounds.min - half, bounds.max + half);
        grown
            .ray_entry_fraction(&self.aabb.center(), &self.direction)
            .filter(|&fraction| fraction <= 1.0)
    }
}

/// Hit of a ray or box cast.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CastResult {
    /// Body whose bounds were hit.
    pub body: BodyId,
    /// Fraction along the cast where the bounds are entered.
    pub fraction: f64,
}

/// Hits that can be ordered by how far along a query they occur.
pub trait CollectorHit: Copy {
    /// Fraction of the hit; 0 for overlap queries.
    fn fraction(&self) -> f64;
}

impl CollectorHit for BodyId {
    fn fraction(&self) -> f64 {
        0.0
    }
}

impl CollectorHit for CastResult {
    fn fraction(&self) -> f64 {
        self.fraction
    }
}

/// Receives the hits of a query.
pub trait CollisionCollector {
    /// Type of hit collected.
    type Hit;

    /// Called for every hit.
    fn add_hit(&mut self, hit: Self::Hit);

    /// Return true to stop the query.
    fn should_early_out(&self) -> bool {
        false
    }

    /// Casts skip hits at or beyond this fraction.
    fn early_out_fraction(&self) -> f64 {
        f64::MAX
    }

    /// Lower the early-out fraction.
    fn update_early_out_fraction(&mut self, fraction: f64) {
        let _ = fraction;
    }
}

/// Collects every hit.
#[derive(Debug, Clone, Default)]
pub struct AllHitCollector<H> {
    /// Hits in the order they were found.
    pub hits: Vec<H>,
}

impl<H: CollectorHit> AllHitCollector<H> {
    /// An empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self { hits: Vec::new() }
    }

    /// Order the hits by fraction, closest first.
    pub fn sort(&mut self) {
        self.hits.sort_by(|a, b| a.fraction().total_cmp(&b.fraction()));
    }

    /// True if nothing was hit.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }
}

impl<H> CollisionCollector for AllHitCollector<H> {
    type Hit = H;

    fn add_hit(&mut self, hit: H) {
        self.hits.push(hit);
    }
}

/// Keeps the hit with the lowest fraction.
#[derive(Debug, Clone)]
pub struct ClosestHitCollector<H> {
    /// Closest hit so far.
    pub hit: Option<H>,
    early_out_fraction: f64,
}

impl<H> Default for ClosestHitCollector<H> {
    fn default() -> Self {
        Self {
            hit: None,
            early_out_fraction: f64::MAX,
        }
    }
}

impl<H: CollectorHit> ClosestHitCollector<H> {
    /// An empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl<H: CollectorHit> CollisionCollector for ClosestHitCollector<H> {
    type Hit = H;

    fn add_hit(&mut self, hit: H) {
        let fraction = hit.fraction();
        if self.hit.is_none() || fraction < self.early_out_fraction {
            self.hit = Some(hit);
            self.update_early_out_fraction(fraction);
        }
    }

    fn early_out_fraction(&self) -> f64 {
        self.early_out_fraction
    }

    fn update_early_out_fraction(&mut self, fraction: f64) {
        self.early_out_fraction = self.early_out_fraction.min(fraction);
    }
}

/// Stops at the first hit.
#[derive(Debug, Clone)]
pub struct AnyHitCollector<H> {
    /// The first hit found.
    pub hit: Option<H>,
}

impl<H> Default for AnyHitCollector<H> {
    fn default() -> Self {
        Self { hit: None }
    }
}

impl<H> AnyHitCollector<H> {
    /// An empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl<H> CollisionCollector for AnyHitCollector<H> {
    type Hit = H;

    fn add_hit(&mut self, hit: H) {
        if self.hit.is_none() {
            self.hit = Some(hit);
        }
    }

    fn should_early_out(&self) -> bool {
        self.hit.is_some()
    }
}

/// Decides whether bodies of a collision layer are reported by a query.
pub trait CollisionLayerFilter {
    /// Return true to report bodies of `layer`.
    fn should_collide(&self, layer: CollisionLayer) -> bool {
        let _ = layer;
        true
    }
}

impl CollisionLayerFilter for AllLayers {}

/// Reports the layers a given collision layer can collide with, according
/// to a pair filter.
#[derive(Clone, Copy)]
pub struct PairCollisionLayerFilter<'a> {
    pair_filter: &'a dyn CollisionLayerPairFilter,
    layer: CollisionLayer,
}

impl<'a> PairCollisionLayerFilter<'a> {
    /// Filter for queries made on behalf of `layer`.
    #[must_use]
    pub fn new(pair_filter: &'a dyn CollisionLayerPairFilter, layer: CollisionLayer) -> Self {
        Self { pair_filter, layer }
    }
}

impl CollisionLayerFilter for PairCollisionLayerFilter<'_> {
    fn should_collide(&self, layer: CollisionLayer) -> bool {
        self.pair_filter.should_collide(self.layer, layer)
    }
}

/// Layer filters applied by a query: which trees are searched and which
/// bodies are reported.
#[derive(Clone, Copy)]
pub struct QueryFilter<'a> {
    /// Broad-phase layers to search.
    pub broad_phase: &'a dyn BroadPhaseLayerFilter,
    /// Collision layers to report.
    pub collision: &'a dyn CollisionLayerFilter,
}

impl Default for QueryFilter<'_> {
    fn default() -> Self {
        Self {
            broad_phase: &AllLayers,
            collision: &AllLayers,
        }
    }
}

/// Overlap query: bounds pass a test, the body passes the collision filter.
struct CollideVisitor<'a, T, C> {
    test: T,
    trackers: &'a [BodyTracker],
    filter: &'a dyn CollisionLayerFilter,
    collector: &'a mut C,
}

impl<T, C> TreeVisitor for CollideVisitor<'_, T, C>
where
    T: Fn(&Aabb) -> bool,
    C: CollisionCollector<Hit = BodyId>,
{
    fn should_abort(&self) -> bool {
        self.collector.should_early_out()
    }

    fn should_visit(&mut self, bounds: &Aabb) -> bool {
        (self.test)(bounds)
    }

    fn visit_body(&mut self, body: BodyId, _: &Aabb) {
        let layer = self.trackers[body.index() as usize].collision_layer;
        if self.filter.should_collide(layer) {
            self.collector.add_hit(body);
        }
    }
}

/// Cast query: children entered before the early-out fraction are visited.
struct CastVisitor<'a, T, C> {
    cast: T,
    trackers: &'a [BodyTracker],
    filter: &'a dyn CollisionLayerFilter,
    collector: &'a mut C,
}

impl<T, C> TreeVisitor for CastVisitor<'_, T, C>
where
    T: Fn(&Aabb) -> Option<f64>,
    C: CollisionCollector<Hit = CastResult>,
{
    fn should_abort(&self) -> bool {
        self.collector.should_early_out()
    }

    fn should_visit(&mut self, bounds: &Aabb) -> bool {
        (self.cast)(bounds).is_some_and(|fraction| fraction < self.collector.early_out_fraction())
    }

    fn visit_body(&mut self, body: BodyId, bounds: &Aabb) {
        let layer = self.trackers[body.index() as usize].collision_layer;
        if !self.filter.should_collide(layer) {
            return;
        }
        if let Some(fraction) = (self.cast)(bounds) {
            self.collector.add_hit(CastResult { body, fraction });
        }
    }
}

impl BroadPhase {
    fn walk_layers(
        &self,
        ctx: &PhysicsLockContext,
        filter: &dyn BroadPhaseLayerFilter,
        visitor: &mut impl TreeVisitor,
    ) {
        let _lock = self.query_lock(ctx);
        for (index, tree) in self.trees.iter().enumerate() {
            if visitor.should_abort() {
                return;
            }
            if tree.has_bodies() && filter.should_collide(BroadPhaseLayer(index as u8)) {
                tree.walk(visitor);
            }
        }
    }

    fn collide<C>(
        &self,
        ctx: &PhysicsLockContext,
        filter: QueryFilter<'_>,
        collector: &mut C,
        test: impl Fn(&Aabb) -> bool,
    ) where
        C: CollisionCollector<Hit = BodyId>,
    {
        let mut visitor = CollideVisitor {
            test,
            trackers: &self.trackers,
            filter: filter.collision,
            collector,
        };
        self.walk_layers(ctx, filter.broad_phase, &mut visitor);
    }

    fn cast<C>(
        &self,
        ctx: &PhysicsLockContext,
        filter: QueryFilter<'_>,
        collector: &mut C,
        cast: impl Fn(&Aabb) -> Option<f64>,
    ) where
        C: CollisionCollector<Hit = CastResult>,
    {
        let mut visitor = CastVisitor {
            cast,
            trackers: &self.trackers,
            filter: filter.collision,
            collector,
        };
        self.walk_layers(ctx, filter.broad_phase, &mut visitor);
    }

    /// Report bodies whose bounds are entered by a ray.
    pub fn cast_ray<C>(
        &self,
        ctx: &PhysicsLockContext,
        ray: &RayCast,
        filter: QueryFilter<'_>,
        collector: &mut C,
    )
    where
        C: CollisionCollector<Hit = CastResult>,
    {
        self.cast(ctx, filter, collector, |bounds| ray.hit_fraction(bounds));
    }

    /// Report bodies whose bounds are touched by a swept box.
    pub fn cast_aabox<C>(
        &self,
        ctx: &PhysicsLockContext,
        cast: &AaBoxCast,
        filter: QueryFilter<'_>,
        collector: &mut C,
    )
    where
        C: CollisionCollector<Hit = CastResult>,
    {
        self.cast(ctx, filter, collector, |bounds| cast.hit_fraction(bounds));
    }

    /// Report bodies whose bounds overlap a box.
    pub fn collide_aabox<C>(
        &self,
        ctx: &PhysicsLockContext,
        aabb: &Aabb,
        filter: QueryFilter<'_>,
        collector: &mut C,
    )
    where
        C: CollisionCollector<Hit = BodyId>,
    {
        self.collide(ctx, filter, collector, |bounds| bounds.overlaps(aabb));
    }

    /// Report bodies whose bounds overlap a sphere.
    pub fn collide_sphere<C>(
        &self,
        ctx: &PhysicsLockContext,
        center: &Point3<f64>,
        radius: f64,
        filter: QueryFilter<'_>,
        collector: &mut C,
    ) where
        C: CollisionCollector<Hit = BodyId>,
    {
        let radius_sq = radius * radius;
        self.collide(ctx, filter, collector, |bounds| {
            bounds.distance_squared_to_point(center) <= radius_sq
        });
    }

    /// Report bodies whose bounds contain a point.
    pub fn collide_point<C>(
        &self,
        ctx: &PhysicsLockContext,
        point: &Point3<f64>,
        filter: QueryFilter<'_>,
        collector: &mut C,
    )
    where
        C: CollisionCollector<Hit = BodyId>,
    {
        self.collide(ctx, filter, collector, |bounds| bounds.contains_point(point));
    }

    /// Report bodies whose bounds overlap an oriented box.
    pub fn collide_oriented_box<C>(
        &self,
        ctx: &PhysicsLockContext,
        oriented_box: &OrientedBox,
        filter: QueryFilter<'_>,
        collector: &mut C,
    ) where
        C: CollisionCollector<Hit = BodyId>,
    {
        self.collide(ctx, filter, collector, |bounds| oriented_box.overlaps(bounds));
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{Isometry3, UnitQuaternion};
    use sim_types::{BodyCreationSettings, BodyManager, MotionType};

    fn hit(index: u32, fraction: f64) -> CastResult {
        CastResult {
            body: BodyId::new(index, 0),
            fraction,
        }
    }

    #[test]
    fn test_closest_hit_keeps_lowest_fraction() {
        let mut collector = ClosestHitCollector::new();
        collector.add_hit(hit(0, 0.7));
        collector.add_hit(hit(1, 0.3));
        collector.add_hit(hit(2, 0.5));

        assert_eq!(collector.hit.unwrap().body, BodyId::new(1, 0));
        assert_eq!(collector.early_out_fraction(), 0.3);
    }

    #[test]
    fn test_any_hit_requests_early_out() {
        let mut collector = AnyHitCollector::new();
        assert!(!collector.should_early_out());
        collector.add_hit(BodyId::new(4, 0));
        collector.add_hit(BodyId::new(5, 0));

        assert!(collector.should_early_out());
        assert_eq!(collector.hit, Some(BodyId::new(4, 0)));
    }

    #[test]
    fn test_all_hits_sort_by_fraction() {
        let mut collector = AllHitCollector::new();
        for (i, f) in [0.9, 0.1, 0.4].into_iter().enumerate() {
            collector.add_hit(hit(i as u32, f));
        }
        collector.sort();
        let order: Vec<u32> = collector.hits.iter().map(|h| h.body.index()).collect();
        assert_eq!(order, vec![1, 2, 0]);
    }

    #[test]
    fn test_box_cast_is_ray_against_grown_box() {
        let target = Aabb::from_center(Point3::new(5.0, 0.0, 0.0), Vector3::repeat(0.5));
        let cast = AaBoxCast::new(
            Aabb::from_center(Point3::origin(), Vector3::repeat(0.5)),
            Vector3::new(10.0, 0.0, 0.0),
        );
        // Faces touch when the center reaches x = 4.
        assert_relative_eq!(cast.hit_fraction(&target).unwrap(), 0.4);

        let short = RayCast::new(Point3::origin(), Vector3::new(2.0, 0.0, 0.0));
        assert!(short.hit_fraction(&target).is_none());
    }

    struct OnlyLayer(BroadPhaseLayer);

    impl BroadPhaseLayerFilter for OnlyLayer {
        fn should_collide(&self, layer: BroadPhaseLayer) -> bool {
            layer == self.0
        }
    }

    struct SkipCollisionLayer(CollisionLayer);

    impl CollisionLayerFilter for SkipCollisionLayer {
        fn should_collide(&self, layer: CollisionLayer) -> bool {
            layer != self.0
        }
    }

    /// Unit spheres along x at 0, 3, 6, 9; the last one in layer 1.
    fn row() -> (BodyManager, BroadPhase, Vec<BodyId>) {
        let mut bodies = BodyManager::new(8);
        let ids: Vec<BodyId> = (0..4)
            .map(|i| {
                let center = Point3::new(3.0 * f64::from(i), 0.0, 0.0);
                let mut settings = BodyCreationSettings::sphere(center, 1.0, MotionType::Static);
                if i == 3 {
                    settings = settings.with_layers(BroadPhaseLayer(1), CollisionLayer(1));
                }
                bodies.create_body(&settings).unwrap()
            })
            .collect();
        let mut broad_phase = BroadPhase::new(8, 2).unwrap();
        broad_phase
            .add_bodies(&PhysicsLockContext::new(), &bodies, &mut ids.clone())
            .unwrap();
        (bodies, broad_phase, ids)
    }

    #[test]
    fn test_ray_hits_sorted_and_closest() {
        let (_, broad_phase, ids) = row();
        let ctx = PhysicsLockContext::new();
        let ray = RayCast::new(Point3::new(-5.0, 0.0, 0.0), Vector3::new(20.0, 0.0, 0.0));

        let mut all = AllHitCollector::new();
        broad_phase.cast_ray(&ctx, &ray, QueryFilter::default(), &mut all);
        all.sort();
        let order: Vec<BodyId> = all.hits.iter().map(|h| h.body).collect();
        assert_eq!(order, ids);
        assert_relative_eq!(all.hits[0].fraction, 0.2);

        let mut closest = ClosestHitCollector::new();
        broad_phase.cast_ray(&ctx, &ray, QueryFilter::default(), &mut closest);
        assert_eq!(closest.hit.unwrap().body, ids[0]);
    }

    #[test]
    fn test_filters_skip_layers() {
        let (_, broad_phase, ids) = row();
        let ctx = PhysicsLockContext::new();
        let everything = Aabb::from_center(Point3::origin(), Vector3::repeat(50.0));

        let only_second = OnlyLayer(BroadPhaseLayer(1));
        let filter = QueryFilter {
            broad_phase: &only_second,
            ..QueryFilter::default()
        };
        let mut hits = AllHitCollector::new();
        broad_phase.collide_aabox(&ctx, &everything, filter, &mut hits);
        assert_eq!(hits.hits, vec![ids[3]]);

        let skip = SkipCollisionLayer(CollisionLayer(0));
        let filter = QueryFilter {
            collision: &skip,
            ..QueryFilter::default()
        };
        let mut hits = AllHitCollector::new();
        broad_phase.collide_aabox(&ctx, &everything, filter, &mut hits);
        assert_eq!(hits.hits, vec![ids[3]]);
    }

    #[test]
    fn test_sphere_and_point_queries() {
        let (_, broad_phase, ids) = row();
        let ctx = PhysicsLockContext::new();

        let mut hits = AllHitCollector::new();
        let center = Point3::new(4.2, 0.0, 0.0);
        broad_phase.collide_sphere(&ctx, &center, 0.6, QueryFilter::default(), &mut hits);
        assert_eq!(hits.hits, vec![ids[1]]);

        let mut any = AnyHitCollector::new();
        let inside = Point3::new(6.5, 0.5, 0.0);
        broad_phase.collide_point(&ctx, &inside, QueryFilter::default(), &mut any);
        assert_eq!(any.hit, Some(ids[2]));

        let mut none = AnyHitCollector::new();
        let between = Point3::new(1.5, 0.0, 0.0);
        broad_phase.collide_point(&ctx, &between, QueryFilter::default(), &mut none);
        assert!(none.hit.is_none());
    }

    #[test]
    fn test_oriented_box_and_box_cast() {
        let (_, broad_phase, ids) = row();
        let ctx = PhysicsLockContext::new();

        let rotated = OrientedBox::new(
            Isometry3::from_parts(
                Vector3::new(6.0, 0.0, 0.0).into(),
                UnitQuaternion::from_euler_angles(0.0, 0.0, std::f64::consts::FRAC_PI_4),
            ),
            Vector3::new(0.2, 0.2, 0.2),
        );
        let mut hits = AllHitCollector::new();
        broad_phase.collide_oriented_box(&ctx, &rotated, QueryFilter::default(), &mut hits);
        assert_eq!(hits.hits, vec![ids[2]]);

        let sweep = AaBoxCast::new(
            Aabb::from_center(Point3::new(0.0, 5.0, 0.0), Vector3::repeat(0.5)),
            Vector3::new(0.0, -10.0, 0.0),
        );
        let mut closest = ClosestHitCollector::new();
        broad_phase.cast_aabox(&ctx, &sweep, QueryFilter::default(), &mut closest);
        let hit = closest.hit.unwrap();
        assert_eq!(hit.body, ids[0]);
        // Bottom face at 4.5 meets the top of the sphere bounds at 1.0.
        assert_relative_eq!(hit.fraction, 0.35);
    }
}
