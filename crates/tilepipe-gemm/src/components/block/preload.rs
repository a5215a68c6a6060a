use core::marker::PhantomData;
use tilepipe_runtime::arch::ArchTag;
use tilepipe_runtime::{CoreContext, DeviceResult, Element};

use super::{BlockMmad, BlockOutput, BlockTask, MmadStages, k_loop_start};
use crate::components::{AccG, BlockTiling, GemmTypes, TierAllocator, TierCaps, TileRequest, is_valid};

/// Block matmul that keeps the staging tier busy across output tiles.
///
/// While the last K tile of a task computes, the first K tile of the next task is already being
/// loaded. With `SHUFFLE_K` every core starts its K loop at `aic_idx % k_tiles`, so cores
/// running side by side read different K slices of the shared operands.
pub struct BlockMmadPreload<
    Arch: ArchTag,
    T: GemmTypes,
    Til: BlockTiling,
    const UNIT_FLAG: bool,
    const SHUFFLE_K: bool,
> {
    stages: MmadStages<T::A, T::B, AccG<T>>,
    preloaded: bool,
    _phantom: PhantomData<(Arch, Til)>,
}

impl<Arch: ArchTag, T: GemmTypes, Til: BlockTiling, const UNIT_FLAG: bool, const SHUFFLE_K: bool>
    BlockMmadPreload<Arch, T, Til, UNIT_FLAG, SHUFFLE_K>
{
    const CHECK: () = {
        assert!(Til::STAGES >= 2, "preload needs two staging slots");
        assert!(
            is_valid(TileRequest::of::<T, Til>(UNIT_FLAG), TierCaps::of::<Arch>()),
            "tile shape does not fit the on-chip tiers"
        );
    };

    fn start(ctx: &CoreContext<'_>, k_tiles: usize) -> usize {
        k_loop_start(ctx.aic_idx(), k_tiles, SHUFFLE_K)
    }
}

impl<Arch: ArchTag, T: GemmTypes, Til: BlockTiling, const UNIT_FLAG: bool, const SHUFFLE_K: bool>
    BlockMmad for BlockMmadPreload<Arch, T, Til, UNIT_FLAG, SHUFFLE_K>
{
    type Arch = Arch;
    type Types = T;
    type Tiling = Til;
    type Params = ();

    const UNIT_FLAG: bool = UNIT_FLAG;

    fn new(
        ctx: &mut CoreContext<'_>,
        allocator: &mut TierAllocator,
        _params: (),
    ) -> DeviceResult<Self> {
        #[allow(clippy::let_unit_value)]
        let () = Self::CHECK;

        let stages = MmadStages::new::<T::LayoutA, T::LayoutB>(
            ctx,
            allocator,
            Til::L1,
            Til::L0,
            Til::STAGES,
            UNIT_FLAG,
        )?;
        Ok(Self {
            stages,
            preloaded: false,
            _phantom: PhantomData,
        })
    }

    fn compute<D: Element>(
        &mut self,
        ctx: &mut CoreContext<'_>,
        task: &BlockTask<T>,
        out: BlockOutput<D>,
        next: Option<&BlockTask<T>>,
    ) -> DeviceResult {
        let k_tiles = self.stages.k_tiles(task);
        let start = Self::start(ctx, k_tiles);
        ctx.log_phase(format_args!("K loop from tile {start} of {k_tiles}"));
        let next = next.map(|next| (next, Self::start(ctx, self.stages.k_tiles(next))));

        self.preloaded = self.stages.run(ctx, task, start, self.preloaded, next)?;
        self.stages.store(ctx, out, task.actual.mn())
    }

    fn finish(mut self, ctx: &mut CoreContext<'_>) -> DeviceResult {
        if self.preloaded {
            log::warn!("Preloaded tile was never computed, discarding it");
            self.stages.discard(ctx)?;
        }
        self.stages.finish(ctx)
    }
}
