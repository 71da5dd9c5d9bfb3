use ndarray::ArrayD;
use std::collections::BTreeMap;
use thiserror::Error;

pub type Tensor = ArrayD<f64>;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum TreeError {
    #[error("Tree structure mismatch at '{path}': {reason}")]
    StructureMismatch { path: String, reason: String },

    #[error("Cannot aggregate an empty collection of trees")]
    Empty,

    #[error("Missing entry '{0}' in parameter tree")]
    MissingKey(String),
}

/// A nested bundle of tensors, the shape shared by design parameters, their
/// gradients and optimizer moments.
///
/// Every elementwise operation walks two or more trees in lockstep and fails
/// with [`TreeError::StructureMismatch`] if they diverge. Map entries are kept
/// in key order so traversal is deterministic.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamTree {
    Leaf(Tensor),
    Map(BTreeMap<String, ParamTree>),
    Seq(Vec<ParamTree>),
}

impl ParamTree {
    pub fn leaf(tensor: Tensor) -> Self {
        ParamTree::Leaf(tensor)
    }

    pub fn from_entries<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, ParamTree)>,
        K: Into<String>,
    {
        ParamTree::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn get(&self, key: &str) -> Option<&ParamTree> {
        match self {
            ParamTree::Map(entries) => entries.get(key),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut ParamTree> {
        match self {
            ParamTree::Map(entries) => entries.get_mut(key),
            _ => None,
        }
    }

    pub fn as_leaf(&self) -> Option<&Tensor> {
        match self {
            ParamTree::Leaf(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_leaf_mut(&mut self) -> Option<&mut Tensor> {
        match self {
            ParamTree::Leaf(t) => Some(t),
            _ => None,
        }
    }

    /// Looks up a leaf stored directly under `key` in a top-level map.
    pub fn leaf_at(&self, key: &str) -> Result<&Tensor, TreeError> {
        self.get(key)
            .and_then(ParamTree::as_leaf)
            .ok_or_else(|| TreeError::MissingKey(key.to_string()))
    }

    pub fn leaf_at_mut(&mut self, key: &str) -> Result<&mut Tensor, TreeError> {
        self.get_mut(key)
            .and_then(ParamTree::as_leaf_mut)
            .ok_or_else(|| TreeError::MissingKey(key.to_string()))
    }

    pub fn insert(&mut self, key: &str, value: ParamTree) -> Result<(), TreeError> {
        match self {
            ParamTree::Map(entries) => {
                entries.insert(key.to_string(), value);
                Ok(())
            }
            _ => Err(TreeError::StructureMismatch {
                path: key.to_string(),
                reason: "cannot insert into a non-map node".to_string(),
            }),
        }
    }

    /// Leaves in depth-first, key-ordered traversal.
    pub fn leaves(&self) -> Vec<&Tensor> {
        let mut out = Vec::new();
        self.collect_leaves(&mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a Tensor>) {
        match self {
            ParamTree::Leaf(t) => out.push(t),
            ParamTree::Map(entries) => entries.values().for_each(|v| v.collect_leaves(out)),
            ParamTree::Seq(items) => items.iter().for_each(|v| v.collect_leaves(out)),
        }
    }

    pub fn map_leaves<F>(&self, mut f: F) -> ParamTree
    where
        F: FnMut(&Tensor) -> Tensor,
    {
        self.map_leaves_inner(&mut f)
    }

    fn map_leaves_inner<F>(&self, f: &mut F) -> ParamTree
    where
        F: FnMut(&Tensor) -> Tensor,
    {
        match self {
            ParamTree::Leaf(t) => ParamTree::Leaf(f(t)),
            ParamTree::Map(entries) => ParamTree::Map(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.map_leaves_inner(f)))
                    .collect(),
            ),
            ParamTree::Seq(items) => {
                ParamTree::Seq(items.iter().map(|v| v.map_leaves_inner(f)).collect())
            }
        }
    }

    pub fn for_each_leaf_mut<F>(&mut self, mut f: F)
    where
        F: FnMut(&mut Tensor),
    {
        self.for_each_leaf_mut_inner(&mut f);
    }

    fn for_each_leaf_mut_inner<F>(&mut self, f: &mut F)
    where
        F: FnMut(&mut Tensor),
    {
        match self {
            ParamTree::Leaf(t) => f(t),
            ParamTree::Map(entries) => entries
                .values_mut()
                .for_each(|v| v.for_each_leaf_mut_inner(f)),
            ParamTree::Seq(items) => items.iter_mut().for_each(|v| v.for_each_leaf_mut_inner(f)),
        }
    }

    pub fn zeros_like(&self) -> ParamTree {
        self.map_leaves(|t| Tensor::zeros(t.raw_dim()))
    }

    pub fn scaled(&self, factor: f64) -> ParamTree {
        self.map_leaves(|t| t * factor)
    }

    /// Combines two trees of identical structure leaf by leaf.
    pub fn zip_with<F>(&self, other: &ParamTree, mut f: F) -> Result<ParamTree, TreeError>
    where
        F: FnMut(&Tensor, &Tensor) -> Tensor,
    {
        self.zip_with_inner(other, &mut f, "")
    }

    fn zip_with_inner<F>(
        &self,
        other: &ParamTree,
        f: &mut F,
        path: &str,
    ) -> Result<ParamTree, TreeError>
    where
        F: FnMut(&Tensor, &Tensor) -> Tensor,
    {
        match (self, other) {
            (ParamTree::Leaf(a), ParamTree::Leaf(b)) => {
                if a.shape() != b.shape() {
                    return Err(TreeError::StructureMismatch {
                        path: display_path(path),
                        reason: format!("leaf shapes {:?} and {:?} differ", a.shape(), b.shape()),
                    });
                }
                Ok(ParamTree::Leaf(f(a, b)))
            }
            (ParamTree::Map(a), ParamTree::Map(b)) => {
                if a.len() != b.len() || a.keys().zip(b.keys()).any(|(ka, kb)| ka != kb) {
                    return Err(TreeError::StructureMismatch {
                        path: display_path(path),
                        reason: "map keys differ".to_string(),
                    });
                }
                a.iter()
                    .zip(b.values())
                    .map(|((k, va), vb)| {
                        let child = format!("{}/{}", path, k);
                        va.zip_with_inner(vb, f, &child).map(|v| (k.clone(), v))
                    })
                    .collect::<Result<BTreeMap<_, _>, _>>()
                    .map(ParamTree::Map)
            }
            (ParamTree::Seq(a), ParamTree::Seq(b)) => {
                if a.len() != b.len() {
                    return Err(TreeError::StructureMismatch {
                        path: display_path(path),
                        reason: format!("sequence lengths {} and {} differ", a.len(), b.len()),
                    });
                }
                a.iter()
                    .zip(b)
                    .enumerate()
                    .map(|(i, (va, vb))| va.zip_with_inner(vb, f, &format!("{}/{}", path, i)))
                    .collect::<Result<Vec<_>, _>>()
                    .map(ParamTree::Seq)
            }
            _ => Err(TreeError::StructureMismatch {
                path: display_path(path),
                reason: "node kinds differ".to_string(),
            }),
        }
    }

    /// Elementwise mean across trees that share one structure.
    pub fn mean(trees: &[ParamTree]) -> Result<ParamTree, TreeError> {
        let (first, rest) = trees.split_first().ok_or(TreeError::Empty)?;
        let sum = rest
            .iter()
            .try_fold(first.clone(), |acc, t| acc.zip_with(t, |a, b| a + b))?;
        Ok(sum.scaled(1.0 / trees.len() as f64))
    }
}

fn display_path(path: &str) -> String {
    if path.is_empty() {
        "/".to_string()
    } else {
        path.to_string()
    }
}
