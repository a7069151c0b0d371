use crate::{
    path::QualifiedPath,
    program::{Command, Phase, Program},
    resource::ResourceId,
};

/// Accumulates commands for both phases of a transaction program, then
/// compiles them into the binary [`Program`].
///
/// The builder preserves per-phase insertion order; a working copy records
/// its effects here as the transaction mutates, so the commit segment replays
/// the mutations and the cleanup segment undoes the scratch state.
#[derive(Default, Debug)]
pub struct ProgramBuilder {
    commit: Vec<Command>,
    cleanup: Vec<Command>,
}

impl ProgramBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn segment(&mut self, phase: Phase) -> &mut Vec<Command> {
        match phase {
            Phase::Commit => &mut self.commit,
            Phase::Cleanup => &mut self.cleanup,
        }
    }

    pub fn push(&mut self, phase: Phase, command: Command) -> &mut Self {
        self.segment(phase).push(command);
        self
    }

    pub fn unlink_file(&mut self, phase: Phase, file: impl Into<String>) -> &mut Self {
        self.push(phase, Command::UnlinkFile { file: file.into() })
    }

    pub fn unlink_path(&mut self, phase: Phase, path: QualifiedPath) -> &mut Self {
        self.push(phase, Command::UnlinkPath { path })
    }

    pub fn remove_resource(&mut self, phase: Phase, id: ResourceId) -> &mut Self {
        self.push(phase, Command::RemoveResource { id })
    }

    pub fn link_file_to_path(
        &mut self,
        phase: Phase,
        file: impl Into<String>,
        path: QualifiedPath,
    ) -> &mut Self {
        self.push(phase, Command::LinkFileToPath { file: file.into(), path })
    }

    pub fn link_resource_to_path(
        &mut self,
        phase: Phase,
        id: ResourceId,
        path: QualifiedPath,
    ) -> &mut Self {
        self.push(phase, Command::LinkResourceToPath { id, path })
    }

    pub fn link_file_to_resource(
        &mut self,
        phase: Phase,
        file: impl Into<String>,
        id: ResourceId,
    ) -> &mut Self {
        self.push(phase, Command::LinkFileToResource { file: file.into(), id })
    }

    /// Drops any pending link of `path` from the commit segment. Undoing a
    /// link staged by the same transaction must cancel it rather than emit an
    /// `UnlinkPath`: within one program a path may carry at most one unlink,
    /// and only before its link, or replay cannot tell the two apart.
    pub fn cancel_path(&mut self, path: &QualifiedPath) -> &mut Self {
        self.commit.retain(|command| {
            !matches!(command,
                Command::LinkFileToPath { path: linked, .. }
                | Command::LinkResourceToPath { path: linked, .. } if linked == path)
        });
        self
    }

    pub fn command_count(&self, phase: Phase) -> usize {
        match phase {
            Phase::Commit => self.commit.len(),
            Phase::Cleanup => self.cleanup.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.commit.is_empty() && self.cleanup.is_empty()
    }

    /// Serializes both segments into an uncommitted [`Program`]. The builder
    /// is consumed; the program still needs [`Program::commit`] before it can
    /// be interpreted or journaled.
    pub fn compile(self) -> Program {
        let mut body = Vec::new();
        for command in self.commit.iter().chain(self.cleanup.iter()) {
            command.encode(&mut body);
        }
        Program::from_segments(self.commit.len() as u16, self.cleanup.len() as u16, &body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(s: &str) -> QualifiedPath {
        QualifiedPath::parse(s).unwrap()
    }

    #[test]
    fn test_compile_preserves_per_phase_order() {
        let id = ResourceId::generate();
        let mut builder = ProgramBuilder::new();
        builder
            .link_file_to_resource(Phase::Commit, "tmp/blob", id)
            .unlink_file(Phase::Cleanup, "tmp/blob")
            .link_resource_to_path(Phase::Commit, id, path("alpha:/a"));
        assert_eq!(builder.command_count(Phase::Commit), 2);
        assert_eq!(builder.command_count(Phase::Cleanup), 1);

        let program = builder.compile();
        let commit = program.commands(Phase::Commit).unwrap();
        assert_eq!(commit[0], Command::LinkFileToResource { file: "tmp/blob".into(), id });
        assert_eq!(
            commit[1],
            Command::LinkResourceToPath { id, path: path("alpha:/a") }
        );
        let cleanup = program.commands(Phase::Cleanup).unwrap();
        assert_eq!(cleanup, vec![Command::UnlinkFile { file: "tmp/blob".into() }]);
    }

    #[test]
    fn test_empty_builder_compiles_to_empty_program() {
        let program = ProgramBuilder::new().compile();
        assert!(program.is_empty());
        assert_eq!(program.len(), Program::HEADER_LEN);
    }
}
