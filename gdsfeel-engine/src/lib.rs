pub mod errors {
    use std::path::PathBuf;

    use thiserror::Error;

    #[derive(Debug, Error)]
    pub enum EngineError {
        #[error("project root is not a directory: {0:?}")]
        ProjectRootMissing(PathBuf),
        #[error("library {0:?} not found")]
        LibraryNotFound(String),
        #[error("structure {0:?} not found in the active library")]
        StructureNotFound(String),
        #[error(transparent)]
        Archive(#[from] gdsfeel_io::ArchiveError),
    }
}

pub mod station {
    use std::path::{Path, PathBuf};

    use tracing::{debug, warn};

    use gdsfeel_core::geometry::DataBounds;
    use gdsfeel_io::{available_libraries, Library};

    use crate::errors::EngineError;

    /// 工作站维护一个工程根下的库清单与"当前库/当前结构"状态，
    /// 供外层界面驱动。
    #[derive(Debug, Default)]
    pub struct Workstation {
        root: Option<PathBuf>,
        libraries: Vec<Library>,
        active_library: Option<usize>,
        active_structure: Option<String>,
    }

    impl Workstation {
        pub fn new() -> Self {
            Self::default()
        }

        /// 在工程根下发现可用库并重置活动状态。
        pub fn setup(&mut self, root: &Path) -> Result<(), EngineError> {
            if !root.is_dir() {
                return Err(EngineError::ProjectRootMissing(root.to_path_buf()));
            }
            self.libraries = available_libraries(root);
            self.root = Some(root.to_path_buf());
            self.active_library = None;
            self.active_structure = None;
            debug!(
                root = %root.display(),
                libraries = self.libraries.len(),
                "workstation set up"
            );
            Ok(())
        }

        /// 关闭全部已打开的库并清空清单。任何一次关闭失败都继续
        /// 处理其余的库，最后报告第一个错误。
        pub fn tear_down(&mut self) -> Result<(), EngineError> {
            let mut first_error = None;
            for library in &mut self.libraries {
                if let Err(err) = library.close() {
                    warn!(library = %library.name(), error = %err, "failed to close library");
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
            self.libraries.clear();
            self.root = None;
            self.active_library = None;
            self.active_structure = None;
            match first_error {
                Some(err) => Err(err.into()),
                None => Ok(()),
            }
        }

        #[inline]
        pub fn root(&self) -> Option<&Path> {
            self.root.as_deref()
        }

        #[inline]
        pub fn library_count(&self) -> usize {
            self.libraries.len()
        }

        pub fn library_names(&self) -> Vec<String> {
            self.libraries
                .iter()
                .map(|library| library.name().to_string())
                .collect()
        }

        /// 按名称激活库并打开它。激活会清空当前结构。
        pub fn set_active_library_named(&mut self, name: &str) -> Result<(), EngineError> {
            let wanted = name.to_uppercase();
            let index = self
                .libraries
                .iter()
                .position(|library| library.name() == wanted)
                .ok_or_else(|| EngineError::LibraryNotFound(name.to_string()))?;
            self.libraries[index].open()?;
            self.active_library = Some(index);
            self.active_structure = None;
            Ok(())
        }

        pub fn active_library(&mut self) -> Option<&mut Library> {
            let index = self.active_library?;
            self.libraries.get_mut(index)
        }

        pub fn active_library_name(&self) -> Option<&str> {
            let index = self.active_library?;
            self.libraries.get(index).map(|library| library.name())
        }

        /// 在当前库中按名称激活结构。没有当前库时记录日志并保持
        /// 原状，不视为错误。
        pub fn set_active_structure_named(&mut self, name: &str) -> Result<(), EngineError> {
            let Some(library) = self.active_library() else {
                warn!(structure = name, "no active library, structure not activated");
                return Ok(());
            };
            let Some(structure) = library.structure_named(name) else {
                return Err(EngineError::StructureNotFound(name.to_string()));
            };
            let canonical = structure.name().to_string();
            self.active_structure = Some(canonical);
            Ok(())
        }

        pub fn active_structure_name(&self) -> Option<&str> {
            self.active_structure.as_deref()
        }

        /// 当前结构的聚合包围盒。无当前库或结构时为 None。
        pub fn active_structure_bounds(&mut self) -> Option<DataBounds> {
            let name = self.active_structure.clone()?;
            self.active_library()?.structure_bounds(&name)
        }
    }

}
