use crate::*;
use serde_json::{from_value, json, to_value};

#[test]
fn response_wire_shape() {
    let ok: Response<u32, Failure> = Response::new(4, Ok(7));
    assert_eq!(to_value(&ok).unwrap(), json!({"id": 4, "ok": 7}));

    let err: Response<u32, Failure> =
        Response::new(5, Err(Failure::new(ErrorKind::NotFound, "/nope")));
    assert_eq!(
        to_value(&err).unwrap(),
        json!({"id": 5, "err": {"kind": "ENOTFOUND", "message": "/nope"}})
    );

    let parsed: Response<u32, Failure> =
        from_value(json!({"id": 9, "err": {"kind": "EACCESS", "message": ""}})).unwrap();
    assert_eq!(parsed.id(), 9);
    assert_eq!(parsed.into_result().unwrap_err().kind, ErrorKind::AccessDenied);
}

#[test]
fn request_wire_shape() {
    let req = Request {
        id: 0,
        payload: Call::new(SyscallName::Access, vec![json!("/bin")]),
    };
    assert_eq!(
        to_value(&req).unwrap(),
        json!({"id": 0, "req": {"name": "access", "args": ["/bin"]}})
    );
}

#[test]
fn dir_entries() {
    assert_eq!(
        to_value(&DirEntry::directory("usr")).unwrap(),
        json!({"type": "directory", "name": "usr"})
    );
    assert_eq!(
        from_value::<DirEntry>(json!({"type": "file", "name": "a.txt"})).unwrap(),
        DirEntry::file("a.txt")
    );
    assert!(from_value::<DirEntry>(json!({"type": "symlink", "name": "x"})).is_err());
}

#[test]
fn write_modes() {
    assert_eq!("after".parse::<WriteMode>(), Ok(WriteMode::After));
    assert_eq!("before".parse::<WriteMode>(), Ok(WriteMode::Before));
    assert_eq!("override".parse::<WriteMode>(), Ok(WriteMode::Override));
    assert_eq!("append".parse::<WriteMode>(), Err(()));
    assert_eq!(to_value(WriteMode::Override).unwrap(), json!("override"));
    assert_eq!(WriteMode::default(), WriteMode::Override);
}

#[test]
fn syscall_names() {
    for name in &[
        SyscallName::Ready,
        SyscallName::ResolveUri,
        SyscallName::DeleteNode,
        SyscallName::Exit,
    ] {
        assert_eq!(name.as_str().parse::<SyscallName>(), Ok(*name));
        assert_eq!(to_value(name).unwrap(), json!(name.as_str()));
    }
    assert_eq!("unlink".parse::<SyscallName>(), Err(()));
}

#[test]
fn exit_codes() {
    assert_eq!(exit::killed(Signal::SIGKILL), 137);
    assert_eq!(exit::killed(Signal::SIGTERM), 143);
    assert_eq!(exit::EXIT_FAULT, 139);
    assert_eq!(exit::EXIT_NOT_FOUND, 127);
}

#[test]
fn spawn_request() {
    let req = SpawnRequest::new("echo")
        .arg("hi")
        .cwd("/tmp")
        .env("PATH", "/bin");
    assert_eq!(req.argv, vec!["echo", "hi"]);
    assert_eq!(req.entrypoint, "echo");
    assert_eq!(req.env.get("PATH").map(String::as_str), Some("/bin"));

    let reply: SpawnReply = from_value(json!({
        "pid": 3,
        "stdin": {"resource": 0},
        "stdout": {"resource": 1},
        "stderr": {"resource": 2},
    }))
    .unwrap();
    assert_eq!(reply.pid, VPid(3));
    assert_eq!(reply.stderr.resource, 2);
}
