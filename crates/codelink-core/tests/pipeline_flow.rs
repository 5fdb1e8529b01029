//! End-to-end pipeline behavior with recording hooks.

use codelink_core::channel::ChannelMap;
use codelink_core::pipeline::{FirmwareQueue, InterceptionMode, Processor};
use codelink_core::{CodeChannel, CodeOutcome, Message, Settings};
use codelink_test_utils::{gcode, mcode, move_code, RecordingHandler, RecordingInterceptor};

fn build(
    interceptor: RecordingInterceptor,
    handler: RecordingHandler,
) -> (Processor, ChannelMap<FirmwareQueue>) {
    Processor::new(
        Settings::default(),
        codelink_core::ModelProvider::new(),
        Box::new(interceptor),
        Box::new(handler),
    )
}

#[tokio::test]
async fn code_visits_every_hook_on_its_way_to_the_firmware() {
    let interceptor = RecordingInterceptor::new();
    let handler = RecordingHandler::new();
    let (processor, mut queues) = build(interceptor.clone(), handler.clone());

    let handle = processor
        .start_code(move_code(CodeChannel::File, 10.0, 20.0))
        .await
        .unwrap();

    let code = queues[CodeChannel::File].recv().await.unwrap();
    processor.code_completed(code).await;
    assert!(matches!(handle.wait().await, CodeOutcome::Resolved(_)));

    let modes: Vec<InterceptionMode> = interceptor.seen().into_iter().map(|(m, _)| m).collect();
    assert_eq!(
        modes,
        vec![
            InterceptionMode::Pre,
            InterceptionMode::Post,
            InterceptionMode::Executed
        ]
    );
    assert_eq!(handler.seen(), vec!["G1 X10 Y20".to_string()]);
}

#[tokio::test]
async fn locally_answered_code_skips_post_interception() {
    let interceptor = RecordingInterceptor::new();
    let handler = RecordingHandler::new();
    handler.answer(115, "FIRMWARE_NAME: codelink");
    let (processor, mut queues) = build(interceptor.clone(), handler.clone());

    let handle = processor
        .start_code(mcode(CodeChannel::Http, 115))
        .await
        .unwrap();
    match handle.wait().await {
        CodeOutcome::Resolved(message) => assert!(message.content.contains("FIRMWARE_NAME")),
        other => panic!("unexpected outcome {other:?}"),
    }

    let modes: Vec<InterceptionMode> = interceptor.seen().into_iter().map(|(m, _)| m).collect();
    assert_eq!(modes, vec![InterceptionMode::Pre, InterceptionMode::Executed]);
    assert!(queues[CodeChannel::Http].try_recv().is_none());
}

#[tokio::test]
async fn interceptor_resolution_at_pre_wins_over_the_handler() {
    let interceptor = RecordingInterceptor::new();
    interceptor.resolve_m_code(291);
    let handler = RecordingHandler::new();
    let (processor, _queues) = build(interceptor, handler.clone());

    let handle = processor
        .start_code(mcode(CodeChannel::Usb, 291))
        .await
        .unwrap();
    match handle.wait().await {
        CodeOutcome::Resolved(message) => {
            assert!(message.content.contains("resolved by test interceptor"));
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert!(handler.seen().is_empty());
}

#[tokio::test]
async fn channels_are_independent_pipelines() {
    let (processor, mut queues) = build(RecordingInterceptor::new(), RecordingHandler::new());

    let file_handle = processor
        .start_code(gcode(CodeChannel::File, 1))
        .await
        .unwrap();
    let usb_handle = processor
        .start_code(gcode(CodeChannel::Usb, 2))
        .await
        .unwrap();

    // Completing the USB code first must not affect the File channel.
    let usb_code = queues[CodeChannel::Usb].recv().await.unwrap();
    processor.code_completed(usb_code).await;
    assert!(matches!(usb_handle.wait().await, CodeOutcome::Resolved(_)));

    let file_code = queues[CodeChannel::File].recv().await.unwrap();
    processor.code_completed(file_code).await;
    assert!(matches!(file_handle.wait().await, CodeOutcome::Resolved(_)));
}

#[tokio::test]
async fn sibling_order_survives_a_failing_code() {
    let interceptor = RecordingInterceptor::new();
    let handler = RecordingHandler::new();
    let (processor, mut queues) = build(interceptor, handler);

    let mut handles = Vec::new();
    for major in [17, 18, 19] {
        handles.push(
            processor
                .start_code(mcode(CodeChannel::Telnet, major))
                .await
                .unwrap(),
        );
    }
    for expected in [17, 18, 19] {
        let code = queues[CodeChannel::Telnet].recv().await.unwrap();
        assert_eq!(code.major, Some(expected));
        processor.code_completed(code).await;
    }
    for handle in handles {
        assert!(matches!(handle.wait().await, CodeOutcome::Resolved(_)));
    }
}

#[tokio::test]
async fn macro_codes_drain_through_their_own_queue() {
    let (processor, mut queues) = build(RecordingInterceptor::new(), RecordingHandler::new());

    let invocation = processor.push_macro(CodeChannel::Spi, "homeall.g");
    let mut handles = Vec::new();
    for (x, y) in [(0.0, 0.0), (5.0, 5.0)] {
        let code = move_code(CodeChannel::Spi, x, y).with_macro(invocation.id);
        handles.push(processor.start_code(code).await.unwrap());
    }
    for _ in 0..2 {
        let code = queues[CodeChannel::Spi].recv().await.unwrap();
        assert_eq!(code.macro_id, Some(invocation.id));
        processor.code_completed(code).await;
    }
    for handle in handles {
        assert!(matches!(handle.wait().await, CodeOutcome::Resolved(_)));
    }
    processor.pop_macro(&invocation).await;
    assert_eq!(processor.stack_depth(CodeChannel::Spi), 1);
}

#[tokio::test]
async fn channel_invalidation_cancels_every_queued_code() {
    let (processor, mut queues) = build(RecordingInterceptor::new(), RecordingHandler::new());

    let mut handles = Vec::new();
    for major in 0..8 {
        handles.push(
            processor
                .start_code(gcode(CodeChannel::File, major))
                .await
                .unwrap(),
        );
    }
    processor.cancel_channel(CodeChannel::File);

    loop {
        match tokio::time::timeout(
            std::time::Duration::from_millis(50),
            queues[CodeChannel::File].recv(),
        )
        .await
        {
            Ok(Some(code)) => processor.code_completed(code).await,
            _ => break,
        }
    }
    for handle in handles {
        assert_eq!(handle.wait().await, CodeOutcome::Cancelled);
    }
}

#[tokio::test]
async fn marlin_channels_get_their_ok() {
    let (processor, mut queues) = build(RecordingInterceptor::new(), RecordingHandler::new());

    let handle = processor
        .start_code(gcode(CodeChannel::Usb, 92))
        .await
        .unwrap();
    let mut code = queues[CodeChannel::Usb].recv().await.unwrap();
    code.reply = Message::success("X:0.00 Y:0.00");
    processor.code_completed(code).await;

    match handle.wait().await {
        CodeOutcome::Resolved(message) => assert_eq!(message.content, "X:0.00 Y:0.00\nok"),
        other => panic!("unexpected outcome {other:?}"),
    }
}
