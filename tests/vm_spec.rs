use retroterm::basic::compiler::compile;
use retroterm::basic::opcode::{Instruction, Opcode};
use retroterm::basic::program::{Bytecode, SourceProgram};
use retroterm::basic::value::Value;
use retroterm::basic::vm::{MAX_FOR_STACK, MAX_STACK, RunOutcome, Vm};
use retroterm::models::message::{Message, MessageKind};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

fn program(lines: &[(u32, &str)]) -> Arc<Bytecode> {
    let mut p = SourceProgram::new();
    for (n, s) in lines {
        p.upsert(*n, *s);
    }
    Arc::new(compile(&p).expect("program compiles"))
}

async fn run_to_end(vm: &mut Vm) -> (RunOutcome, Vec<Message>) {
    let (tx, mut rx) = mpsc::channel(1024);
    let (_cancel_tx, cancel_rx) = watch::channel(false);
    let outcome = vm.run(&tx, &cancel_rx).await.expect("run succeeds");
    drop(tx);
    let mut msgs = Vec::new();
    while let Ok(m) = rx.try_recv() {
        msgs.push(m);
    }
    (outcome, msgs)
}

fn texts(msgs: &[Message]) -> Vec<String> {
    msgs.iter()
        .filter(|m| m.kind == MessageKind::Text)
        .map(|m| m.content.clone())
        .collect()
}

#[tokio::test]
async fn arithmetic_scenario() {
    // 10 PRINT 2+3 / 20 PRINT (2+3)*4 / 30 END
    let bc = program(&[(10, "PRINT 2+3"), (20, "PRINT (2+3)*4"), (30, "END")]);
    let mut vm = Vm::new(bc);
    let (outcome, msgs) = run_to_end(&mut vm).await;
    assert_eq!(outcome, RunOutcome::Done);
    assert_eq!(texts(&msgs), vec!["5", "20"]);
    assert!(vm.pending_input().is_none());
    assert_eq!(vm.stack_size(), 0);
    assert_eq!(vm.for_depth(), 0);
}

#[tokio::test]
async fn for_loop_scenario() {
    // 10 FOR I=1 TO 3 / 20 PRINT I / 30 NEXT I / 40 END
    let bc = program(&[
        (10, "FOR I=1 TO 3"),
        (20, "PRINT I"),
        (30, "NEXT I"),
        (40, "END"),
    ]);
    let mut vm = Vm::new(bc);
    let (outcome, msgs) = run_to_end(&mut vm).await;
    assert_eq!(outcome, RunOutcome::Done);
    assert_eq!(texts(&msgs), vec!["1", "2", "3"]);
    assert_eq!(vm.for_depth(), 0);
    assert_eq!(vm.var("I"), Some(&Value::Num(4.0)));
}

#[tokio::test]
async fn zero_iteration_loops_push_no_frame() {
    for (start, end, step) in [(5.0, 1.0, 1.0), (1.0, 5.0, -1.0)] {
        let src = format!("FOR I={start} TO {end} STEP {step}");
        let bc = program(&[(10, src.as_str()), (20, "PRINT I"), (30, "NEXT I"), (40, "PRINT \"after\"")]);
        let mut vm = Vm::new(bc);
        let (_, msgs) = run_to_end(&mut vm).await;
        assert_eq!(texts(&msgs), vec!["after"]);
        assert_eq!(vm.for_depth(), 0);
    }
}

#[tokio::test]
async fn gosub_nesting_and_logic() {
    let bc = program(&[
        (10, "X = 4"),
        (20, "IF X > 3 AND X < 10 THEN GOSUB 100 ELSE PRINT \"nope\""),
        (30, "PRINT \"done\""),
        (40, "END"),
        (100, "PRINT \"in sub\""),
        (110, "RETURN"),
    ]);
    let mut vm = Vm::new(bc);
    let (_, msgs) = run_to_end(&mut vm).await;
    assert_eq!(texts(&msgs), vec!["in sub", "done"]);
}

#[tokio::test]
async fn input_suspends_resumes_and_preserves_invariants() {
    let bc = program(&[
        (10, "INPUT \"What is your name\"; N$"),
        (20, "PRINT \"Hello, \" + N$"),
        (30, "END"),
    ]);
    let mut vm = Vm::new(bc);
    let (outcome, msgs) = run_to_end(&mut vm).await;
    let RunOutcome::AwaitingInput { prompt } = outcome else {
        panic!("expected suspension");
    };
    assert_eq!(prompt, "What is your name");
    assert!(msgs.iter().any(|m| m.kind == MessageKind::Prompt));
    assert!(!vm.is_running());
    assert!(vm.stack_size() <= MAX_STACK);

    vm.resume("Grace").unwrap();
    let (outcome, msgs) = run_to_end(&mut vm).await;
    assert_eq!(outcome, RunOutcome::Done);
    assert_eq!(texts(&msgs), vec!["Hello, Grace"]);
}

#[tokio::test]
async fn cancellation_mid_execution() {
    let bc = program(&[(10, "GOTO 10")]);
    let mut vm = Vm::new(bc);
    let (tx, _rx) = mpsc::channel(16);
    let (cancel_tx, cancel_rx) = watch::channel(false);

    let canceller = tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let _ = cancel_tx.send(true);
    });
    let outcome = vm.run(&tx, &cancel_rx).await.unwrap();
    canceller.await.unwrap();
    assert_eq!(outcome, RunOutcome::Cancelled);
    assert!(!vm.is_running());
}

#[tokio::test]
async fn runtime_error_report_carries_context() {
    let bc = program(&[(10, "I = 7"), (20, "PRINT 1/0")]);
    let mut vm = Vm::new(bc);
    let (tx, _rx) = mpsc::channel(16);
    let (_c, cancel_rx) = watch::channel(false);
    let err = vm.run(&tx, &cancel_rx).await.unwrap_err().to_string();
    assert!(err.contains("line 20"), "{err}");
    assert!(err.contains("division by zero"), "{err}");
    assert!(err.contains("pc="), "{err}");
    assert!(err.contains("PRINT 1/0"), "{err}");
    assert!(err.contains("I=7"), "{err}");
}

#[tokio::test]
async fn value_stack_limit_holds() {
    // Hand-built program that pushes forever without popping
    let mut bc = Bytecode::default();
    bc.num_consts.push(1.0);
    bc.instructions.push(Instruction::with_a(Opcode::PushNum, 0, 10));
    bc.instructions
        .push(Instruction::with_ab(Opcode::Jump, 0, retroterm::basic::opcode::TARGET_ABSOLUTE, 10));
    let mut vm = Vm::new(Arc::new(bc));
    let (tx, _rx) = mpsc::channel(16);
    let (_c, cancel_rx) = watch::channel(false);
    let err = vm.run(&tx, &cancel_rx).await.unwrap_err().to_string();
    assert!(err.contains("stack overflow"), "{err}");
    assert!(vm.stack_size() <= MAX_STACK);
}

#[tokio::test]
async fn for_stack_limit_holds() {
    // 51 nested loops exceed the FOR stack
    let mut p = SourceProgram::new();
    let depth = MAX_FOR_STACK + 1;
    for i in 0..depth {
        p.upsert((i as u32 + 1) * 10, format!("FOR V{i}=1 TO 2"));
    }
    for i in (0..depth).rev() {
        p.upsert((depth as u32 + (depth - i) as u32) * 10, format!("NEXT V{i}"));
    }
    let bc = Arc::new(compile(&p).unwrap());
    let mut vm = Vm::new(bc);
    let (tx, _rx) = mpsc::channel(16);
    let (_c, cancel_rx) = watch::channel(false);
    let err = vm.run(&tx, &cancel_rx).await.unwrap_err().to_string();
    assert!(err.contains("FOR nesting too deep"), "{err}");
}

#[tokio::test]
async fn listing_reparse_compiles_identically() {
    let mut p = SourceProgram::new();
    p.upsert(10, "FOR I=1 TO 10 STEP 2");
    p.upsert(20, "PRINT I; \" squared is \"; I*I");
    p.upsert(30, "NEXT I");
    p.upsert(40, "IF I > 10 THEN PRINT \"big\" ELSE PRINT \"small\"");
    p.upsert(50, "END");
    let first = compile(&p).unwrap();
    let reparsed = SourceProgram::from_listing(&p.listing());
    let second = compile(&reparsed).unwrap();
    assert_eq!(first.instructions, second.instructions);
    assert_eq!(first.labels, second.labels);
    assert_eq!(first.num_consts, second.num_consts);
    assert_eq!(first.str_consts, second.str_consts);
}

#[tokio::test]
async fn jump_targets_always_resolve() {
    let bc = program(&[
        (10, "GOSUB 100"),
        (20, "IF X THEN 40"),
        (30, "GOTO 50"),
        (40, "PRINT 1"),
        (50, "END"),
        (100, "RETURN"),
    ]);
    bc.validate().expect("all jump targets resolve");
}
