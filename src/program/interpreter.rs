use crate::{
    error::StoreError,
    path::QualifiedPath,
    program::{Command, Phase, Program},
    resource::ResourceId,
};
use log::trace;

/// Receiver for the effects of an interpreted program.
///
/// The store implements this against its indices and blob directory; tests
/// implement it against in-memory state. Handlers must be idempotent: crash
/// recovery replays already partially applied programs from the journal.
pub trait ExecutionHandler {
    fn unlink_file(&mut self, file: &str) -> Result<(), StoreError>;
    fn unlink_path(&mut self, path: &QualifiedPath) -> Result<(), StoreError>;
    fn remove_resource(&mut self, id: ResourceId) -> Result<(), StoreError>;
    fn link_file_to_path(&mut self, file: &str, path: &QualifiedPath) -> Result<(), StoreError>;
    fn link_resource_to_path(
        &mut self,
        id: ResourceId,
        path: &QualifiedPath,
    ) -> Result<(), StoreError>;
    fn link_file_to_resource(&mut self, file: &str, id: ResourceId) -> Result<(), StoreError>;
}

/// Runs one phase segment of a committed program against `handler`, in
/// command order. A program that was not committed for `phase` is refused.
pub fn interpret<H: ExecutionHandler>(
    program: &Program,
    phase: Phase,
    handler: &mut H,
) -> Result<(), StoreError> {
    if !program.is_committed() {
        return Err(StoreError::IllegalState("cannot interpret an uncommitted program"));
    }
    if !program.phases().contains(phase) {
        return Err(StoreError::IllegalState("program was not committed for this phase"));
    }

    for command in program.commands(phase)? {
        trace!("interpret {:?} command {:?} for {}", phase, command.opcode(), program.revision());
        match &command {
            Command::Noop => {}
            Command::UnlinkFile { file } => handler.unlink_file(file)?,
            Command::UnlinkPath { path } => handler.unlink_path(path)?,
            Command::RemoveResource { id } => handler.remove_resource(*id)?,
            Command::LinkFileToPath { file, path } => handler.link_file_to_path(file, path)?,
            Command::LinkResourceToPath { id, path } => {
                handler.link_resource_to_path(*id, path)?
            }
            Command::LinkFileToResource { file, id } => handler.link_file_to_resource(file, *id)?,
        }
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::{testing::RecordingHandler, *};
    use crate::{
        program::{ChecksumAlgorithm, PhaseMask, ProgramBuilder},
        revision::Revision,
    };

    fn path(s: &str) -> QualifiedPath {
        QualifiedPath::parse(s).unwrap()
    }

    #[test]
    fn test_interprets_only_requested_phase() {
        let mut builder = ProgramBuilder::new();
        builder.unlink_path(Phase::Commit, path("alpha:/a"));
        builder.unlink_file(Phase::Cleanup, "tmp/scratch");
        let mut program = builder.compile();
        program.commit(PhaseMask::ALL, ChecksumAlgorithm::Crc32, Revision::new(5));

        let mut handler = RecordingHandler::default();
        interpret(&program, Phase::Commit, &mut handler).unwrap();
        assert_eq!(handler.calls, ["unlink_path alpha:/a"]);

        let mut handler = RecordingHandler::default();
        interpret(&program, Phase::Cleanup, &mut handler).unwrap();
        assert_eq!(handler.calls, ["unlink_file tmp/scratch"]);
    }

    #[test]
    fn test_refuses_uncommitted_program() {
        let program = ProgramBuilder::new().compile();
        let mut handler = RecordingHandler::default();
        assert!(matches!(
            interpret(&program, Phase::Commit, &mut handler),
            Err(StoreError::IllegalState(_))
        ));
    }

    #[test]
    fn test_refuses_phase_outside_mask() {
        let mut builder = ProgramBuilder::new();
        builder.unlink_file(Phase::Commit, "tmp/a");
        builder.unlink_file(Phase::Cleanup, "tmp/b");
        let mut program = builder.compile();
        // Rollback programs carry only the cleanup phase; their commit
        // segment must stay untouchable even though it is present.
        program.commit(PhaseMask::CLEANUP, ChecksumAlgorithm::Crc32, Revision::new(2));

        let mut handler = RecordingHandler::default();
        assert!(interpret(&program, Phase::Commit, &mut handler).is_err());
        assert!(handler.calls.is_empty());

        interpret(&program, Phase::Cleanup, &mut handler).unwrap();
        assert_eq!(handler.calls, ["unlink_file tmp/b"]);
    }
}
