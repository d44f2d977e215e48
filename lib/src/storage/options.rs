use crate::storage::binary_encoder::IndexOrder;
use crate::storage::digest_pool::DigestAlgorithm;
use crate::storage::error::StorageError;

pub(crate) const TRIPLE_NATURAL_ORDER: &str = "SPO";
pub(crate) const QUAD_NATURAL_ORDER: &str = "GSPO";
const DEFAULT_DIGEST_POOL_CAPACITY: usize = 16;

/// Options used to create or open a [`Store`](crate::store::Store).
///
/// ```
/// use oxtdb::store::StoreOptions;
/// use oxtdb::storage::DigestAlgorithm;
///
/// let options = StoreOptions::default()
///     .with_digest_algorithm(DigestAlgorithm::Sha256)
///     .with_triple_indexes("SPO", ["POS"]);
/// assert_eq!(options.digest_algorithm(), DigestAlgorithm::Sha256);
/// ```
#[derive(Clone, Debug)]
pub struct StoreOptions {
    digest_algorithm: DigestAlgorithm,
    digest_pool_capacity: usize,
    triple_primary: String,
    triple_secondaries: Vec<String>,
    quad_primary: String,
    quad_secondaries: Vec<String>,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            digest_algorithm: DigestAlgorithm::default(),
            digest_pool_capacity: DEFAULT_DIGEST_POOL_CAPACITY,
            triple_primary: "SPO".into(),
            triple_secondaries: vec!["POS".into(), "OSP".into()],
            quad_primary: "GSPO".into(),
            quad_secondaries: vec![
                "GPOS".into(),
                "GOSP".into(),
                "SPOG".into(),
                "POSG".into(),
                "OSPG".into(),
            ],
        }
    }
}

impl StoreOptions {
    /// Sets the digest used to derive term identifiers.
    ///
    /// It can't be changed once the store holds data.
    pub fn with_digest_algorithm(mut self, algorithm: DigestAlgorithm) -> Self {
        self.digest_algorithm = algorithm;
        self
    }

    /// Sets how many idle digest engines are kept for reuse.
    pub fn with_digest_pool_capacity(mut self, capacity: usize) -> Self {
        self.digest_pool_capacity = capacity;
        self
    }

    /// Sets the index orders of the default graph table, with one letter among `S`, `P` and `O`
    /// per column.
    pub fn with_triple_indexes(
        mut self,
        primary: impl Into<String>,
        secondaries: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.triple_primary = primary.into();
        self.triple_secondaries = secondaries.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the index orders of the named graphs table, with one letter among `G`, `S`, `P` and
    /// `O` per column.
    pub fn with_quad_indexes(
        mut self,
        primary: impl Into<String>,
        secondaries: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.quad_primary = primary.into();
        self.quad_secondaries = secondaries.into_iter().map(Into::into).collect();
        self
    }

    pub fn digest_algorithm(&self) -> DigestAlgorithm {
        self.digest_algorithm
    }

    pub fn digest_pool_capacity(&self) -> usize {
        self.digest_pool_capacity
    }

    pub(crate) fn triple_orders(&self) -> Result<(IndexOrder, Vec<IndexOrder>), StorageError> {
        parse_orders(
            &self.triple_primary,
            &self.triple_secondaries,
            TRIPLE_NATURAL_ORDER,
        )
    }

    pub(crate) fn quad_orders(&self) -> Result<(IndexOrder, Vec<IndexOrder>), StorageError> {
        parse_orders(&self.quad_primary, &self.quad_secondaries, QUAD_NATURAL_ORDER)
    }
}

fn parse_orders(
    primary: &str,
    secondaries: &[String],
    natural: &str,
) -> Result<(IndexOrder, Vec<IndexOrder>), StorageError> {
    let primary = IndexOrder::parse(primary, natural)?;
    let mut parsed = Vec::with_capacity(secondaries.len());
    for secondary in secondaries {
        let order = IndexOrder::parse(secondary, natural)?;
        if order == primary || parsed.contains(&order) {
            return Err(StorageError::config(format!(
                "the index order {order} is configured twice"
            )));
        }
        parsed.push(order);
    }
    Ok((primary, parsed))
}
