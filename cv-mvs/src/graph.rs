use crate::MvsError;
use std::collections::HashMap;

/// Specifies which views can act as stereo pairs and how much 3D information
/// each pairing is expected to contain.
///
/// Vertices and edges live in arenas and refer to each other by index, so a
/// vertex can reach "the other side" of any of its edges in constant time.
/// The graph carries no geometry itself; it only describes relationships.
#[derive(Debug, Clone, Default)]
pub struct StereoPairGraph {
    vertices: Vec<Vertex>,
    edges: Vec<Edge>,
    index_of: HashMap<String, usize>,
}

/// A view that can participate in stereo pairs.
#[derive(Debug, Clone)]
pub struct Vertex {
    /// Unique identifier of the view, used to look up its image.
    pub id: String,
    /// The view's index in the optimized scene structure.
    pub index_sba: usize,
    /// Indices of every edge this vertex participates in.
    pub pairs: Vec<usize>,
}

/// A candidate stereo pair between two views.
#[derive(Debug, Clone)]
pub struct Edge {
    /// Indices of the two vertices the edge connects.
    pub vertices: [usize; 2],
    /// Normalized quality of the 3D information between the pair.
    /// 0.0 means none and 1.0 is the best possible. Always in [0, 1].
    pub quality_3d: f64,
}

impl StereoPairGraph {
    pub fn new() -> Self {
        Default::default()
    }

    /// Adds a view to the graph. The id must not already be present.
    pub fn add_vertex(&mut self, id: impl Into<String>, index_sba: usize) -> Result<usize, MvsError> {
        let id = id.into();
        if self.index_of.contains_key(&id) {
            return Err(MvsError::DuplicateVertex(id));
        }
        let index = self.vertices.len();
        self.index_of.insert(id.clone(), index);
        self.vertices.push(Vertex {
            id,
            index_sba,
            pairs: vec![],
        });
        Ok(index)
    }

    /// Connects two existing views as a candidate stereo pair.
    ///
    /// The quality must lie in [0, 1]; anything else is a malformed input,
    /// not something to clamp.
    pub fn connect(&mut self, id_a: &str, id_b: &str, quality_3d: f64) -> Result<usize, MvsError> {
        let a = self.vertex_index(id_a).ok_or_else(|| MvsError::UnknownVertex(id_a.to_string()))?;
        let b = self.vertex_index(id_b).ok_or_else(|| MvsError::UnknownVertex(id_b.to_string()))?;
        if !(0.0..=1.0).contains(&quality_3d) {
            return Err(MvsError::QualityOutOfRange {
                left: id_a.to_string(),
                right: id_b.to_string(),
                quality: quality_3d,
            });
        }
        let edge = self.edges.len();
        self.edges.push(Edge {
            vertices: [a, b],
            quality_3d,
        });
        self.vertices[a].pairs.push(edge);
        self.vertices[b].pairs.push(edge);
        Ok(edge)
    }

    /// The vertex on the opposite side of the edge from `vertex`.
    pub fn other(&self, edge: usize, vertex: usize) -> Result<usize, MvsError> {
        let [a, b] = self.edges[edge].vertices;
        if vertex == a {
            Ok(b)
        } else if vertex == b {
            Ok(a)
        } else {
            Err(MvsError::NotAnEndpoint(self.vertices[vertex].id.clone()))
        }
    }

    pub fn vertex(&self, index: usize) -> &Vertex {
        &self.vertices[index]
    }

    pub fn vertex_index(&self, id: &str) -> Option<usize> {
        self.index_of.get(id).copied()
    }

    pub fn vertices(&self) -> &[Vertex] {
        &self.vertices
    }

    pub fn edge(&self, index: usize) -> &Edge {
        &self.edges[index]
    }

    pub fn edge_mut(&mut self, index: usize) -> &mut Edge {
        &mut self.edges[index]
    }

    pub fn len(&self) -> usize {
        self.vertices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }
}
