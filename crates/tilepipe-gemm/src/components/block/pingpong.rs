use core::marker::PhantomData;
use tilepipe_runtime::arch::ArchTag;
use tilepipe_runtime::{CoreContext, DeviceResult, Element};

use super::{BlockMmad, BlockOutput, BlockTask, MmadStages};
use crate::components::{AccG, BlockTiling, GemmTypes, TierAllocator, TierCaps, TileRequest, is_valid};

/// Plain double buffered block matmul.
///
/// The first K tile is loaded, then every iteration loads K tile `k + 1` into the other staging
/// slot before computing K tile `k`.
pub struct BlockMmadPingpong<Arch: ArchTag, T: GemmTypes, Til: BlockTiling, const UNIT_FLAG: bool> {
    stages: MmadStages<T::A, T::B, AccG<T>>,
    _phantom: PhantomData<(Arch, Til)>,
}

impl<Arch: ArchTag, T: GemmTypes, Til: BlockTiling, const UNIT_FLAG: bool>
    BlockMmadPingpong<Arch, T, Til, UNIT_FLAG>
{
    const CHECK: () = {
        assert!(Til::STAGES >= 2, "pingpong needs two staging slots");
        assert!(
            is_valid(TileRequest::of::<T, Til>(UNIT_FLAG), TierCaps::of::<Arch>()),
            "tile shape does not fit the on-chip tiers"
        );
    };
}

impl<Arch: ArchTag, T: GemmTypes, Til: BlockTiling, const UNIT_FLAG: bool> BlockMmad
    for BlockMmadPingpong<Arch, T, Til, UNIT_FLAG>
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
            _phantom: PhantomData,
        })
    }

    fn compute<D: Element>(
        &mut self,
        ctx: &mut CoreContext<'_>,
        task: &BlockTask<T>,
        out: BlockOutput<D>,
        _next: Option<&BlockTask<T>>,
    ) -> DeviceResult {
        self.stages.run(ctx, task, 0, false, None)?;
        self.stages.store(ctx, out, task.actual.mn())
    }

    fn finish(self, ctx: &mut CoreContext<'_>) -> DeviceResult {
        self.stages.finish(ctx)
    }
}
