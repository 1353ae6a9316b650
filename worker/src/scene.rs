// The scene value and the capability traits the ray engine drives. The
// worker core never interprets geometry; it moves ray states through these
// three seams and routes the results.

use thiserror::Error;

use treelet_shared::{CropWindow, ObjectKey, RayData, RayState, SampleId};

use crate::storage::{ObjectStore, StorageError};

#[derive(Debug, Error)]
pub enum SceneError {
    #[error("scene object {key:?} is missing from storage")]
    MissingObject { key: String },
    #[error("scene object {key:?} is malformed: {reason}")]
    Malformed { key: String, reason: String },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// One intersection step against the held treelets. Consumes the ray and
/// returns it updated: traversal stack popped/pushed, hit recorded, shadow
/// occlusion noted.
pub trait Tracer {
    fn trace(&self, ray: RayState) -> RayState;
}

/// Secondary rays spawned by shading a hit, plus whether the path is done
pub struct ShadeOutput {
    pub rays: Vec<RayState>,
    pub path_completed: bool,
}

/// Shade a ray that has a hit and an exhausted traversal stack
pub trait Shader {
    fn shade(&self, ray: RayState) -> ShadeOutput;
}

/// A camera sample for one pixel: the primary ray, its film position, and
/// the sample weight.
pub struct CameraSample {
    pub ray: RayData,
    pub p_film: (f32, f32),
    pub weight: f32,
}

pub trait CameraModel {
    fn sample_bounds(&self) -> CropWindow;
    fn samples_per_pixel(&self) -> u32;
    fn generate_sample(&self, pixel: (i32, i32), sample_num: u32) -> CameraSample;
}

/// Everything loaded on GetObjects, owned by the worker and immutable for
/// the rest of the job.
pub struct Scene {
    pub camera: Box<dyn CameraModel>,
    pub tracer: Box<dyn Tracer>,
    pub shader: Box<dyn Shader>,
    pub max_depth: u32,
}

/// Builds a Scene from fetched objects. The geometry backend plugs in
/// here; the core only requires that the listed objects resolve.
pub trait SceneBuilder {
    fn build(&self, objects: &[ObjectKey], store: &dyn ObjectStore) -> Result<Scene, SceneError>;
}

// A stand-in scene used until a geometry backend is linked in: one sample
// per pixel over a fixed window, rays that terminate as misses on their
// first trace, and a shader that never runs. Useful for transport-only
// runs and benchmarks.
mod null_backend {
    use super::*;
    use treelet_shared::DEFAULT_MAX_DEPTH;

    pub struct NullCamera {
        pub bounds: CropWindow,
    }

    impl CameraModel for NullCamera {
        fn sample_bounds(&self) -> CropWindow {
            self.bounds
        }

        fn samples_per_pixel(&self) -> u32 {
            1
        }

        fn generate_sample(&self, pixel: (i32, i32), _sample_num: u32) -> CameraSample {
            CameraSample {
                ray: RayData::new(
                    [pixel.0 as f32, pixel.1 as f32, 0.0],
                    [0.0, 0.0, 1.0],
                ),
                p_film: (pixel.0 as f32 + 0.5, pixel.1 as f32 + 0.5),
                weight: 1.0,
            }
        }
    }

    pub struct NullTracer;

    impl Tracer for NullTracer {
        fn trace(&self, mut ray: RayState) -> RayState {
            ray.to_visit.pop();
            ray
        }
    }

    pub struct NullShader;

    impl Shader for NullShader {
        fn shade(&self, _ray: RayState) -> ShadeOutput {
            ShadeOutput {
                rays: Vec::new(),
                path_completed: true,
            }
        }
    }

    pub struct NullSceneBuilder;

    impl SceneBuilder for NullSceneBuilder {
        fn build(
            &self,
            _objects: &[ObjectKey],
            _store: &dyn ObjectStore,
        ) -> Result<Scene, SceneError> {
            Ok(Scene {
                camera: Box::new(NullCamera {
                    bounds: CropWindow {
                        min: (0, 0),
                        max: (64, 64),
                    },
                }),
                tracer: Box::new(NullTracer),
                shader: Box::new(NullShader),
                max_depth: DEFAULT_MAX_DEPTH,
            })
        }
    }
}

pub use null_backend::{NullCamera, NullSceneBuilder, NullShader, NullTracer};

pub fn sample_id_for(pixel: (i32, i32), bounds: &CropWindow, spp: u32, sample_num: u32) -> SampleId {
    let extent_x = (bounds.max.0 - bounds.min.0).max(1) as i64;
    let linear = (pixel.0 - bounds.min.0) as i64 + (pixel.1 - bounds.min.1) as i64 * extent_x;
    (linear as u64) * spp as u64 + sample_num as u64
}
