//! Loading triangle meshes and computing their bounding volumes.
extern crate cgmath;
extern crate itertools;
extern crate nalgebra as na;
extern crate ply_rs;
extern crate rand;
extern crate tobj;

use cgmath::prelude::*;
use cgmath::Point3;
use itertools::Itertools;
use ply_rs::ply::{DefaultElement, Property};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use crate::Error;

/// Relative slack used when testing whether a point lies inside a sphere.
const CONTAINMENT_EPS: f64 = 1e-9;

/// Support points whose normalized Gram determinant is below this are affinely dependent.
const AFFINE_EPS: f64 = 1e-12;

/// Vertex geometry of a single mesh file. Faces are not kept, all queries only need vertices.
#[derive(Debug, Clone)]
pub struct Mesh {
    pub name: String,
    pub vertices: Vec<Point3<f64>>,
}

/// A sphere given by its center and radius.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sphere {
    pub center: Point3<f64>,
    pub radius: f64,
}

impl Sphere {
    fn empty() -> Self {
        Sphere {
            center: Point3::origin(),
            radius: -1.0,
        }
    }

    pub fn diameter(&self) -> f64 {
        2.0 * self.radius
    }

    pub fn contains(&self, p: &Point3<f64>) -> bool {
        self.center.distance(*p) <= self.radius * (1.0 + CONTAINMENT_EPS) + CONTAINMENT_EPS
    }

    /// Sphere through all points of `support` with its center in their affine hull. Returns `None`
    /// if the points are affinely dependent.
    ///
    /// The center is searched as `p0 + sum(l_i * (p_i - p0))`, which gives the linear system
    /// `2 (a_i . a_j) l_j = a_i . a_i` with `a_i = p_i - p0`.
    fn circumscribe(support: &[Point3<f64>]) -> Option<Self> {
        let p0 = *support.first()?;
        let a = support[1..].iter().map(|p| *p - p0).collect::<Vec<_>>();
        let m = a.len();
        if m > 3 {
            return None;
        }
        let gram = na::DMatrix::<f64>::from_fn(m, m, |i, j| 2.0 * a[i].dot(a[j]));
        let rhs = na::DVector::<f64>::from_fn(m, |i, _| a[i].magnitude2());

        // det(G) / prod(G_ii) is the squared sine volume of the a_i
        let scale = (0..m).map(|i| gram[(i, i)]).product::<f64>();
        if !(gram.determinant().abs() > AFFINE_EPS * scale) {
            return None;
        }
        let lambda = gram.lu().solve(&rhs)?;
        let center = a
            .iter()
            .zip(lambda.iter())
            .fold(p0, |c, (ai, li)| c + *ai * *li);
        let radius = center.distance(p0);
        if radius.is_finite() {
            Some(Sphere { center, radius })
        } else {
            None
        }
    }

    /// Smallest sphere with every point of `support` on its boundary, together with the dimension
    /// of the affine hull that determines it. Dependent supports (cocircular or repeated points)
    /// use the smallest sphere through a subset that still contains the whole support.
    fn from_support(support: &[Point3<f64>]) -> (Self, usize) {
        match support.len() {
            0 => (Sphere::empty(), 0),
            1 => (
                Sphere {
                    center: support[0],
                    radius: 0.0,
                },
                0,
            ),
            k => {
                if let Some(sphere) = Sphere::circumscribe(support) {
                    return (sphere, k - 1);
                }
                (0..k)
                    .map(|skip| {
                        let subset = support
                            .iter()
                            .enumerate()
                            .filter(|(i, _)| *i != skip)
                            .map(|(_, p)| *p)
                            .collect::<Vec<_>>();
                        Sphere::from_support(&subset)
                    })
                    .filter(|(sphere, _)| support.iter().all(|p| sphere.contains(p)))
                    .fold1(|x, y| if x.0.radius <= y.0.radius { x } else { y })
                    .unwrap_or_else(|| (Sphere::from_farthest_pair(support), 1))
            }
        }
    }

    /// Sphere spanned by the two farthest points of `support`.
    fn from_farthest_pair(support: &[Point3<f64>]) -> Self {
        support
            .iter()
            .tuple_combinations()
            .map(|(a, b)| Sphere {
                center: a.midpoint(*b),
                radius: a.distance(*b) / 2.0,
            })
            .fold1(|x, y| if x.radius >= y.radius { x } else { y })
            .unwrap_or_else(Sphere::empty)
    }
}

/// Welzl's algorithm: minimum sphere containing `points` with all of `support` on its boundary.
/// The support never holds more than 5 points, so recursion stays shallow.
fn welzl(points: &[Point3<f64>], support: &mut Vec<Point3<f64>>) -> Sphere {
    let (mut sphere, dim) = Sphere::from_support(support);
    if dim == 3 || support.len() > 4 {
        return sphere;
    }

    for i in 0..points.len() {
        if !sphere.contains(&points[i]) {
            support.push(points[i]);
            sphere = welzl(&points[..i], support);
            support.pop();
        }
    }
    sphere
}

impl Mesh {
    pub fn new(name: String, vertices: Vec<Point3<f64>>) -> Result<Self, Error> {
        if vertices.is_empty() {
            return Err(Error::EmptyMesh(name));
        }
        Ok(Mesh { name, vertices })
    }

    /// Load a mesh from a `.obj` or `.ply` file.
    pub fn from_file(path: &Path) -> Result<Self, Error> {
        let ext = path
            .extension()
            .and_then(|x| x.to_str())
            .map(|x| x.to_lowercase());
        match ext.as_ref().map(|x| x.as_str()) {
            Some("obj") => Self::from_obj(path),
            Some("ply") => Self::from_ply(path),
            _ => Err(Error::IOError(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("unsupported mesh format {}", path.display()),
            ))),
        }
    }

    /// Load all models of a Wavefront `.obj` file as one vertex set.
    pub fn from_obj(path: &Path) -> Result<Self, Error> {
        let (models, _) = tobj::load_obj(path)
            .map_err(|e| Error::ParseError(format!("{}: {:?}", path.display(), e)))?;
        let vertices = models
            .iter()
            .flat_map(|model| model.mesh.positions.iter().tuples())
            .map(|(x, y, z)| Point3::new(*x as f64, *y as f64, *z as f64))
            .collect();
        Mesh::new(path.display().to_string(), vertices)
    }

    /// Load the `vertex` element of an ascii or binary `.ply` file.
    pub fn from_ply(path: &Path) -> Result<Self, Error> {
        let mut reader = BufReader::new(File::open(path)?);
        let parser = ply_rs::parser::Parser::<DefaultElement>::new();
        let ply = parser.read_ply(&mut reader)?;

        let coordinate = |vertex: &DefaultElement, key: &str| -> Result<f64, Error> {
            match vertex.get(key) {
                Some(Property::Float(x)) => Ok(*x as f64),
                Some(Property::Double(x)) => Ok(*x),
                Some(Property::Int(x)) => Ok(*x as f64),
                Some(Property::UInt(x)) => Ok(*x as f64),
                Some(Property::Short(x)) => Ok(*x as f64),
                Some(Property::UShort(x)) => Ok(*x as f64),
                _ => Err(Error::ParseError(format!(
                    "{}: vertex is missing scalar property {}",
                    path.display(),
                    key
                ))),
            }
        };

        let vertices = match ply.payload.get("vertex") {
            Some(elements) => elements
                .iter()
                .map(|v| {
                    Ok(Point3::new(
                        coordinate(v, "x")?,
                        coordinate(v, "y")?,
                        coordinate(v, "z")?,
                    ))
                })
                .collect::<Result<Vec<_>, Error>>()?,
            None => Vec::new(),
        };
        Mesh::new(path.display().to_string(), vertices)
    }

    /// Axis aligned bounding box as `(min, max)`. Without vertices `min` is `+inf` and `max` is
    /// `-inf` on every axis.
    pub fn bounds(&self) -> (Point3<f64>, Point3<f64>) {
        let inf = std::f64::INFINITY;
        self.vertices
            .iter()
            .fold((Point3::new(inf, inf, inf), Point3::new(-inf, -inf, -inf)), |(lo, hi), p| {
                (
                    Point3::new(lo.x.min(p.x), lo.y.min(p.y), lo.z.min(p.z)),
                    Point3::new(hi.x.max(p.x), hi.y.max(p.y), hi.z.max(p.z)),
                )
            })
    }

    /// Center of the axis aligned bounding box.
    pub fn bounds_center(&self) -> Point3<f64> {
        let (lo, hi) = self.bounds();
        lo.midpoint(hi)
    }

    /// Minimum bounding sphere of all vertices.
    pub fn bounding_sphere(&self) -> Sphere {
        // Welzl runs in expected linear time on a random permutation. The seed is fixed so that
        // repeated runs agree bit for bit.
        let mut points = self.vertices.clone();
        let mut rng = StdRng::seed_from_u64(0);
        points.shuffle(&mut rng);

        let mut sphere = welzl(&points, &mut Vec::with_capacity(5));

        // grow to cover points lost to round-off in degenerate support sets
        let max_dist = points
            .iter()
            .map(|p| sphere.center.distance(*p))
            .fold(0.0, f64::max);
        sphere.radius = sphere.radius.max(max_dist);
        sphere
    }
}

#[cfg(test)]
fn cube(half: f64) -> Mesh {
    let vertices = (0..8)
        .map(|i| {
            let s = |bit: i32| if i & bit == 0 { -half } else { half };
            Point3::new(s(1), s(2), s(4))
        })
        .collect();
    Mesh::new("cube".to_string(), vertices).unwrap()
}

#[test]
fn test_bounds_cube() {
    let (lo, hi) = cube(1.0).bounds();
    assert_eq!(lo, Point3::new(-1.0, -1.0, -1.0));
    assert_eq!(hi, Point3::new(1.0, 1.0, 1.0));
    assert_eq!(cube(1.0).bounds_center(), Point3::new(0.0, 0.0, 0.0));
}

#[test]
fn test_bounding_sphere_cube() {
    let sphere = cube(1.0).bounding_sphere();
    assert!((sphere.diameter() - 2.0 * 3f64.sqrt()).abs() < 1e-9);
    assert!(sphere.center.distance(Point3::origin()) < 1e-9);
}

#[test]
fn test_bounding_sphere_is_minimal_for_segment() {
    let mesh = Mesh::new(
        "segment".to_string(),
        vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(4.0, 0.0, 0.0),
            Point3::new(2.0, 0.5, 0.0),
        ],
    )
    .unwrap();
    let sphere = mesh.bounding_sphere();
    assert!((sphere.radius - 2.0).abs() < 1e-9);
    assert!(sphere.center.distance(Point3::new(2.0, 0.0, 0.0)) < 1e-9);
}

#[test]
fn test_bounding_sphere_contains_all_points() {
    use rand::Rng;
    let mut rng = StdRng::seed_from_u64(7);
    let vertices = (0..500)
        .map(|_| {
            Point3::new(
                rng.gen_range(-3.0, 1.0),
                rng.gen_range(0.0, 2.0),
                rng.gen_range(-0.5, 0.5),
            )
        })
        .collect::<Vec<_>>();
    let mesh = Mesh::new("random".to_string(), vertices).unwrap();
    let sphere = mesh.bounding_sphere();
    assert!(mesh.vertices.iter().all(|p| sphere.contains(p)));
    // never larger than the sphere around the bounding box
    let (lo, hi) = mesh.bounds();
    assert!(sphere.diameter() <= lo.distance(hi) + 1e-9);
    assert!(sphere.diameter() > 0.0);
}

#[test]
fn test_bounds_without_vertices() {
    let mesh = Mesh {
        name: "literal".to_string(),
        vertices: Vec::new(),
    };
    let (lo, hi) = mesh.bounds();
    assert!(lo.x.is_infinite() && lo.x > 0.0);
    assert!(hi.z.is_infinite() && hi.z < 0.0);
}

#[test]
fn test_empty_mesh_is_error() {
    match Mesh::new("nothing".to_string(), Vec::new()) {
        Err(Error::EmptyMesh(name)) => assert_eq!(name, "nothing"),
        x => panic!("expected EmptyMesh, got {:?}", x),
    }
}

#[test]
fn test_load_ply_ascii() {
    use std::io::Write;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("obj_000003.ply");
    let mut f = File::create(&path).unwrap();
    write!(
        f,
        "ply\nformat ascii 1.0\nelement vertex 3\nproperty float x\nproperty float y\n\
         property float z\nelement face 1\nproperty list uchar int vertex_indices\nend_header\n\
         0 0 0\n0.5 0 0\n0 0.25 -1\n3 0 1 2\n"
    )
    .unwrap();
    drop(f);

    let mesh = Mesh::from_file(&path).unwrap();
    assert_eq!(mesh.vertices.len(), 3);
    let (lo, hi) = mesh.bounds();
    assert_eq!(lo, Point3::new(0.0, 0.0, -1.0));
    assert_eq!(hi, Point3::new(0.5, 0.25, 0.0));
}

#[test]
fn test_load_obj_fixture() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/cube.obj");
    let mesh = Mesh::from_file(&path).unwrap();
    assert_eq!(mesh.vertices.len(), 8);
    assert_eq!(mesh.bounds().0, Point3::new(-1.0, -1.0, -1.0));
}

#[test]
fn test_unknown_extension() {
    assert!(Mesh::from_file(Path::new("model.stl")).is_err());
}
