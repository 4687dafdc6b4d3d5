//! Spatial discretization sizes and the flat index map of the global state
//! vector.
//!
//! The global ordering is fixed: bulk concentrations component-major, then
//! one particle block per column cell (shells from center to surface, each
//! shell liquid phase first, then bound states), then the film fluxes
//! cell-major.

/// Sizes of the spatial discretization.
#[derive(Debug, Clone)]
pub struct Discretization {
    /// Number of chemical components.
    pub n_comp: usize,
    /// Number of axial column cells.
    pub n_col: usize,
    /// Number of radial particle shells.
    pub n_par: usize,
    /// Bound states per component.
    pub n_bound: Vec<usize>,
    /// Exclusive prefix sum of `n_bound`.
    pub bound_offset: Vec<usize>,
    /// Total bound states per shell.
    pub stride_bound: usize,
}

impl Discretization {
    pub fn new(n_comp: usize, n_col: usize, n_par: usize, n_bound: Vec<usize>) -> Self {
        assert_eq!(n_bound.len(), n_comp);
        let mut bound_offset = Vec::with_capacity(n_comp);
        let mut acc = 0;
        for nb in &n_bound {
            bound_offset.push(acc);
            acc += nb;
        }
        Self {
            n_comp,
            n_col,
            n_par,
            n_bound,
            bound_offset,
            stride_bound: acc,
        }
    }
}

/// Maps component/cell/shell/bound-state tuples to flat offsets into the
/// global state vector.
#[derive(Debug, Clone, Copy)]
pub struct Indexer<'a> {
    disc: &'a Discretization,
}

impl<'a> Indexer<'a> {
    pub fn new(disc: &'a Discretization) -> Self {
        Self { disc }
    }

    /// Stride between two cells of the same component in the bulk block.
    pub fn stride_col_cell(&self) -> usize {
        1
    }

    /// Stride between two components in the bulk block.
    pub fn stride_col_comp(&self) -> usize {
        self.disc.n_col
    }

    /// Entries per particle shell (liquid plus bound states).
    pub fn stride_par_shell(&self) -> usize {
        self.disc.n_comp + self.disc.stride_bound
    }

    /// Liquid-phase entries per shell.
    pub fn stride_par_liquid(&self) -> usize {
        self.disc.n_comp
    }

    /// Bound-state entries per shell.
    pub fn stride_par_bound(&self) -> usize {
        self.disc.stride_bound
    }

    /// Entries per particle block (all shells of one column cell).
    pub fn stride_par_block(&self) -> usize {
        self.disc.n_par * self.stride_par_shell()
    }

    /// Offset of the bulk entry of component `comp` in cell `cell`.
    pub fn offset_c(&self, comp: usize, cell: usize) -> usize {
        comp * self.stride_col_comp() + cell * self.stride_col_cell()
    }

    /// Offset of the particle block of column cell `cell`.
    pub fn offset_cp(&self, cell: usize) -> usize {
        self.disc.n_comp * self.disc.n_col + cell * self.stride_par_block()
    }

    /// Offset of the flux block.
    pub fn offset_jf(&self) -> usize {
        self.disc.n_comp * self.disc.n_col + self.disc.n_col * self.stride_par_block()
    }

    /// Offset of the flux entry of component `comp` in cell `cell`,
    /// relative to [`Self::offset_jf`].
    pub fn offset_jf_local(&self, comp: usize, cell: usize) -> usize {
        cell * self.disc.n_comp + comp
    }

    /// Offset of the first bound state of component `comp` within the
    /// bound-state part of a shell.
    pub fn offset_bound_comp(&self, comp: usize) -> usize {
        self.disc.bound_offset[comp]
    }

    /// Total number of degrees of freedom.
    pub fn num_dofs(&self) -> usize {
        self.offset_jf() + self.disc.n_col * self.disc.n_comp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offsets_partition_the_state() {
        let disc = Discretization::new(2, 16, 4, vec![1, 1]);
        let idxr = Indexer::new(&disc);
        assert_eq!(idxr.stride_par_shell(), 4);
        assert_eq!(idxr.stride_par_block(), 16);
        assert_eq!(idxr.offset_cp(0), 32);
        assert_eq!(idxr.offset_cp(1), 48);
        assert_eq!(idxr.offset_jf(), 32 + 16 * 16);
        // total = bulk + particle + flux
        assert_eq!(idxr.num_dofs(), 2 * 16 + 16 * 4 * (2 + 2) + 16 * 2);
    }

    #[test]
    fn test_bound_offsets() {
        let disc = Discretization::new(3, 8, 2, vec![1, 2, 0]);
        let idxr = Indexer::new(&disc);
        assert_eq!(disc.stride_bound, 3);
        assert_eq!(idxr.offset_bound_comp(0), 0);
        assert_eq!(idxr.offset_bound_comp(1), 1);
        assert_eq!(idxr.offset_bound_comp(2), 3);
    }

    #[test]
    fn test_flux_ordering_is_cell_major() {
        let disc = Discretization::new(2, 4, 2, vec![1, 1]);
        let idxr = Indexer::new(&disc);
        assert_eq!(idxr.offset_jf_local(0, 0), 0);
        assert_eq!(idxr.offset_jf_local(1, 0), 1);
        assert_eq!(idxr.offset_jf_local(0, 1), 2);
    }
}
